use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;

use super::ast::{
    CommandNode, DeclarationNode, Expression, Statement, Template, is_action, is_entity,
};
use super::value::{Hole, ParamValue, Value};
use super::{Result, TemplateError};

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+$").expect("ipv4 pattern"));
static CIDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.\d+\.\d+\.\d+)/(\d+)$").expect("cidr pattern"));
static INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("int pattern"));
static FLOAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+\.\d+$").expect("float pattern"));

/// Parse template text into a [`Template`] with a fresh id.
///
/// Lines may end with `\n`, `\r\n` or `\r`. Blank lines and `#`/`//` comments
/// are skipped.
pub fn parse(text: &str) -> Result<Template> {
    let mut statements = Vec::new();
    for (idx, line) in split_lines(text).into_iter().enumerate() {
        let mut parser = Parser::new(line, idx + 1);
        if let Some(statement) = parser.parse_statement()? {
            statements.push(statement);
        }
    }
    Ok(Template::new(statements))
}

/// Parse a whitespace separated `key=value` list, as typed on a command line.
pub fn parse_params(text: &str) -> Result<BTreeMap<String, ParamValue>> {
    let mut parser = Parser::new(text, 1);
    parser.parse_params()
}

fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&text[start..i]);
                start = i + 1;
            }
            b'\r' => {
                lines.push(&text[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn is_ident_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, b'_' | b'.' | b'-')
}

fn is_bare_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            b'-' | b'.' | b'_' | b':' | b'/' | b'+' | b';' | b'~' | b'@' | b'<' | b'>' | b'*'
        )
}

/// Characters that turn a following `+` into the concatenation operator.
fn starts_non_bare_atom(ch: u8) -> bool {
    matches!(ch, b'{' | b'$' | b'\'' | b'"' | b'@')
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: usize,
}

type ParseResult<T> = std::result::Result<T, TemplateError>;

impl<'a> Parser<'a> {
    fn new(src: &'a str, line: usize) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
            line,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.index;
        while matches!(self.current(), Some(b' ' | b'\t')) {
            self.advance();
        }
        self.index > start
    }

    fn at_comment(&self) -> bool {
        match self.current() {
            Some(b'#') => true,
            Some(b'/') => self.peek(1) == Some(b'/'),
            _ => false,
        }
    }

    /// End of line, possibly after trailing whitespace and a comment.
    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.eof() || self.at_comment()
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.index;
        while let Some(ch) = self.current() {
            if !pred(ch) {
                break;
            }
            self.advance();
        }
        &self.src[start..self.index]
    }

    fn parse_statement(&mut self) -> ParseResult<Option<Statement>> {
        if self.at_end() {
            return Ok(None);
        }
        let start = self.index;
        let word = self.take_while(is_ident_char);
        if word.is_empty() {
            return Err(self.error(format!(
                "unexpected symbol '{}'",
                self.current().map(char::from).unwrap_or(' ')
            )));
        }
        self.skip_ws();
        if self.current() == Some(b'=') {
            self.advance();
            let expr = self.parse_expression()?;
            return Ok(Some(Statement::Declaration(DeclarationNode {
                ident: word.to_string(),
                expr,
            })));
        }
        self.index = start;
        Ok(Some(Statement::Command(self.parse_command()?)))
    }

    fn parse_expression(&mut self) -> ParseResult<Expression> {
        self.skip_ws();
        let start = self.index;
        let word = self.take_while(|ch| ch.is_ascii_alphanumeric());
        let is_command = is_action(word)
            && matches!(self.current(), Some(b' ' | b'\t'))
            && {
                self.skip_ws();
                self.current().is_some_and(is_ident_char)
            };
        self.index = start;
        if is_command {
            return Ok(Expression::Command(self.parse_command()?));
        }
        if self.at_end() {
            return Err(self.error("missing value after '='"));
        }
        let value = self.parse_value(true)?;
        if !self.at_end() {
            return Err(self.error(format!(
                "unexpected symbol '{}' after value",
                self.current().map(char::from).unwrap_or(' ')
            )));
        }
        Ok(Expression::Value(value))
    }

    fn parse_command(&mut self) -> ParseResult<CommandNode> {
        let action = self.take_while(is_ident_char);
        if !is_action(action) {
            return Err(self.error(format!("unknown action '{}'", action)));
        }
        if !self.skip_ws() || self.eof() {
            return Err(self.error(format!("missing entity after action '{}'", action)));
        }
        let entity = self.take_while(is_ident_char);
        if !is_entity(entity) {
            return Err(self.error(format!("unknown entity '{}'", entity)));
        }
        let mut node = CommandNode::new(action, entity);
        node.params = self.parse_params()?;
        Ok(node)
    }

    fn parse_params(&mut self) -> ParseResult<BTreeMap<String, ParamValue>> {
        let mut params = BTreeMap::new();
        while !self.at_end() {
            let key = self.take_while(is_ident_char);
            if key.is_empty() {
                return Err(self.error(format!(
                    "unexpected symbol '{}' where a param key was expected",
                    self.current().map(char::from).unwrap_or(' ')
                )));
            }
            self.skip_ws();
            if self.current() != Some(b'=') {
                return Err(self.error(format!("expected '=' after param key '{}'", key)));
            }
            self.advance();
            self.skip_ws();
            if self.eof() {
                return Err(self.error(format!("missing value for param '{}'", key)));
            }
            let value = self.parse_value(true)?;
            if params.insert(key.to_string(), value).is_some() {
                return Err(self.error(format!("duplicate param '{}'", key)));
            }
            if !self.eof() && !matches!(self.current(), Some(b' ' | b'\t')) {
                return Err(self.error(format!(
                    "unexpected symbol '{}' after param '{}'",
                    self.current().map(char::from).unwrap_or(' '),
                    key
                )));
            }
        }
        Ok(params)
    }

    /// A value possibly made of several concatenated atoms.
    ///
    /// At top level a bare comma separated sequence is read as a list.
    fn parse_value(&mut self, top_level: bool) -> ParseResult<ParamValue> {
        let (first, first_bare) = self.parse_atom()?;
        if top_level && first_bare && self.current() == Some(b',') {
            return self.parse_csv(first);
        }
        let mut pieces = vec![first];
        let mut prev_bare = first_bare;
        loop {
            match self.current() {
                Some(b'+')
                    if !prev_bare || self.peek(1).is_some_and(starts_non_bare_atom) =>
                {
                    self.advance();
                    if self.eof() || matches!(self.current(), Some(b' ' | b'\t')) {
                        return Err(self.error("expected value after '+'"));
                    }
                }
                Some(b'{' | b'$' | b'\'' | b'"') => {}
                Some(ch) if !prev_bare && is_bare_char(ch) => {}
                _ => break,
            }
            let (piece, bare) = self.parse_atom()?;
            pieces.push(piece);
            prev_bare = bare;
        }
        if pieces.len() == 1 {
            return Ok(pieces.remove(0));
        }
        let mut concat = ParamValue::Concat(pieces);
        concat.normalize();
        Ok(concat)
    }

    fn parse_csv(&mut self, first: ParamValue) -> ParseResult<ParamValue> {
        let mut items = vec![csv_item(first)];
        while self.current() == Some(b',') {
            self.advance();
            let token = self.take_while(is_bare_char);
            if token.is_empty() {
                return Err(self.error("empty element in comma separated list"));
            }
            items.push(ParamValue::string(token));
        }
        if items.len() < 3 {
            return Err(self.error("comma separated list needs at least three elements, use [a,b] instead"));
        }
        Ok(ParamValue::List(items))
    }

    /// One atom plus whether it was a bare token.
    fn parse_atom(&mut self) -> ParseResult<(ParamValue, bool)> {
        match self.current() {
            Some(b'\'') | Some(b'"') => {
                let text = self.parse_quoted()?;
                Ok((ParamValue::string(text), false))
            }
            Some(b'$') => {
                self.advance();
                let ident = self.take_while(is_ident_char);
                if ident.is_empty() {
                    return Err(self.error("missing identifier after '$'"));
                }
                Ok((ParamValue::Reference(ident.to_string()), false))
            }
            Some(b'{') => {
                self.advance();
                self.skip_ws();
                let key = self.take_while(is_ident_char);
                if key.is_empty() {
                    return Err(self.error("missing key in hole"));
                }
                self.skip_ws();
                if self.current() != Some(b'}') {
                    return Err(self.error(format!("unterminated hole '{{{}'", key)));
                }
                self.advance();
                Ok((ParamValue::Hole(Hole::new(key)), false))
            }
            Some(b'@') => {
                self.advance();
                let name = match self.current() {
                    Some(b'\'') | Some(b'"') => self.parse_quoted()?,
                    _ => self.take_bare_token().to_string(),
                };
                if name.is_empty() {
                    return Err(self.error("missing name after '@'"));
                }
                Ok((ParamValue::Alias(name), false))
            }
            Some(b'[') => Ok((self.parse_list()?, false)),
            Some(ch) if is_bare_char(ch) => {
                let token = self.take_bare_token();
                Ok((self.classify(token)?, true))
            }
            Some(ch) => Err(self.error(format!("unexpected symbol '{}'", ch as char))),
            None => Err(self.error("unexpected end of line")),
        }
    }

    /// Bare token, stopping before a `+` that starts a concatenation.
    fn take_bare_token(&mut self) -> &'a str {
        let start = self.index;
        while let Some(ch) = self.current() {
            if !is_bare_char(ch) {
                break;
            }
            if ch == b'+' && self.peek(1).is_some_and(starts_non_bare_atom) {
                break;
            }
            self.advance();
        }
        &self.src[start..self.index]
    }

    fn parse_quoted(&mut self) -> ParseResult<String> {
        let Some(quote) = self.current() else {
            return Err(self.error("expected quoted string"));
        };
        self.advance();
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch == quote {
                let text = self.src[start..self.index].to_string();
                self.advance();
                return Ok(text);
            }
            self.advance();
        }
        Err(self.error(format!("unterminated string starting with {}", quote as char)))
    }

    fn parse_list(&mut self) -> ParseResult<ParamValue> {
        // consume '['
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.current() {
                None => return Err(self.error("unterminated list")),
                Some(b']') => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            items.push(self.parse_value(false)?);
            self.skip_ws();
            match self.current() {
                Some(b',') => self.advance(),
                Some(b']') => {}
                None => return Err(self.error("unterminated list")),
                Some(ch) => {
                    return Err(self.error(format!("unexpected symbol '{}' in list", ch as char)));
                }
            }
        }
        let mut list = ParamValue::List(items);
        list.normalize();
        Ok(list)
    }

    fn classify(&self, token: &str) -> ParseResult<ParamValue> {
        if INT.is_match(token) {
            let digits = token.trim_start_matches('-');
            if digits.len() > 1 && digits.starts_with('0') {
                return Ok(ParamValue::string(token));
            }
            return Ok(match token.parse::<i64>() {
                Ok(n) => ParamValue::Literal(Value::Int(n)),
                Err(_) => ParamValue::string(token),
            });
        }
        if FLOAT.is_match(token) {
            let int_part = token.trim_start_matches('-');
            if int_part.len() > 1 && int_part.starts_with('0') && !int_part.starts_with("0.") {
                return Ok(ParamValue::string(token));
            }
            return Ok(match token.parse::<f64>() {
                Ok(f) => ParamValue::Literal(Value::Float(f)),
                Err(_) => ParamValue::string(token),
            });
        }
        if IPV4.is_match(token) {
            return match token.parse::<Ipv4Addr>() {
                Ok(ip) => Ok(ParamValue::string(ip.to_string())),
                Err(_) => Err(self.error(format!("invalid IP address '{}'", token))),
            };
        }
        if let Some(caps) = CIDR.captures(token) {
            let ip = caps[1].parse::<Ipv4Addr>();
            let prefix = caps[2].parse::<u32>();
            return match (ip, prefix) {
                (Ok(ip), Ok(prefix)) if prefix <= 32 => {
                    Ok(ParamValue::string(canonical_cidr(ip, prefix)))
                }
                _ => Err(self.error(format!("invalid CIDR '{}'", token))),
            };
        }
        Ok(ParamValue::string(token))
    }
}

fn csv_item(value: ParamValue) -> ParamValue {
    match value {
        ParamValue::Literal(v) => ParamValue::string(v.to_plain_string()),
        other => other,
    }
}

/// Network address form of `ip/prefix`, e.g. `10.0.2.5/24` becomes `10.0.2.0/24`.
fn canonical_cidr(ip: Ipv4Addr, prefix: u32) -> String {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    format!("{}/{}", network, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_params(text: &str) -> BTreeMap<String, ParamValue> {
        let tpl = parse(text).unwrap();
        tpl.command_nodes().next().unwrap().params.clone()
    }

    #[test]
    fn parses_commands_and_declarations() {
        let tpl = parse(
            "# a comment\r\ncreate vpc cidr=10.0.0.0/16\r\n\r\nsub = create subnet vpc=$vpc // trailing\rname = 'my name'\n",
        )
        .unwrap();
        assert_eq!(tpl.statements.len(), 3);
        assert_eq!(
            tpl.to_string(),
            "create vpc cidr=10.0.0.0/16\nsub = create subnet vpc=$vpc\nname = 'my name'"
        );
    }

    #[test]
    fn unknown_action_or_entity_names_the_token() {
        let err = parse("foo bar").unwrap_err().to_string();
        assert!(err.contains("'foo'"), "{}", err);
        let err = parse("create bar name=x").unwrap_err().to_string();
        assert!(err.contains("'bar'"), "{}", err);
        let err = parse("create instance\nx = stop woot").unwrap_err().to_string();
        assert!(err.contains("line 2") && err.contains("'woot'"), "{}", err);
    }

    #[test]
    fn literal_classification() {
        let params = single_params(
            "create instance count=42 zero=0123 ratio=1.5 ports=80-443 ip=10.0.0.1 neg=-3",
        );
        assert_eq!(params["count"], ParamValue::Literal(Value::Int(42)));
        assert_eq!(params["zero"], ParamValue::string("0123"));
        assert_eq!(params["ratio"], ParamValue::Literal(Value::Float(1.5)));
        assert_eq!(params["ports"], ParamValue::string("80-443"));
        assert_eq!(params["ip"], ParamValue::string("10.0.0.1"));
        assert_eq!(params["neg"], ParamValue::Literal(Value::Int(-3)));
    }

    #[test]
    fn malformed_network_literals_fail() {
        assert!(parse("create subnet cidr=10.0.0.300/24").is_err());
        assert!(parse("create subnet cidr=10.0.0.0/33").is_err());
        assert!(parse("create instance ip=999.1.1.1").is_err());
        let params = single_params("create subnet cidr=10.0.2.5/24");
        assert_eq!(params["cidr"], ParamValue::string("10.0.2.0/24"));
    }

    #[test]
    fn value_forms() {
        let params = single_params(
            "create loadbalancer subnets=[sub-1, @my-sub, $ref,{a.b}] name=@\"my lb\" tags=a,b,c",
        );
        assert_eq!(
            params["subnets"],
            ParamValue::List(vec![
                ParamValue::string("sub-1"),
                ParamValue::Alias("my-sub".into()),
                ParamValue::Reference("ref".into()),
                ParamValue::Hole(Hole::new("a.b")),
            ])
        );
        assert_eq!(params["name"], ParamValue::Alias("my lb".into()));
        assert_eq!(
            params["tags"],
            ParamValue::List(vec![
                ParamValue::string("a"),
                ParamValue::string("b"),
                ParamValue::string("c"),
            ])
        );
    }

    #[test]
    fn bare_comma_lists_need_three_elements() {
        let err = parse("create loadbalancer name=lb subnets=sub-1,sub-2").unwrap_err();
        assert!(err.to_string().contains("at least three elements"), "{}", err);
        let params = single_params("create loadbalancer name=lb subnets=[sub-1,sub-2]");
        assert_eq!(
            params["subnets"],
            ParamValue::List(vec![ParamValue::string("sub-1"), ParamValue::string("sub-2")])
        );
    }

    #[test]
    fn concatenations() {
        let tpl = parse("name = \"ins$\\ta{nce}-\"+{instance.name}+{version}\ncreate instance image=ami-1234 name=$name subnet=subnet-{version} path=a+b").unwrap();
        let decl = tpl.declarations().next().unwrap();
        assert_eq!(
            decl.expr,
            Expression::Value(ParamValue::Concat(vec![
                ParamValue::string("ins$\\ta{nce}-"),
                ParamValue::Hole(Hole::new("instance.name")),
                ParamValue::Hole(Hole::new("version")),
            ]))
        );
        let cmd = tpl.command_nodes().next().unwrap();
        assert_eq!(
            cmd.params["subnet"],
            ParamValue::Concat(vec![
                ParamValue::string("subnet-"),
                ParamValue::Hole(Hole::new("version")),
            ])
        );
        assert_eq!(cmd.params["path"], ParamValue::string("a+b"));
        assert_eq!(
            tpl.to_string(),
            "name = 'ins$\\ta{nce}-'+{instance.name}+{version}\ncreate instance image=ami-1234 name=$name path=a+b subnet=subnet-+{version}"
        );
        assert_eq!(parse(&tpl.to_string()).unwrap(), tpl);
    }

    #[test]
    fn quoted_concat_collapses() {
        let params = single_params("create instance name='a b'+\"c\"");
        assert_eq!(params["name"], ParamValue::string("a bc"));
    }

    #[test]
    fn duplicate_params_and_bad_syntax_fail() {
        assert!(parse("create instance name=a name=b").is_err());
        assert!(parse("create instance name=").is_err());
        assert!(parse("create instance name='unterminated").is_err());
        assert!(parse("create instance subnets=[a, b").is_err());
        assert!(parse("create").is_err());
    }

    #[test]
    fn value_that_looks_like_an_action() {
        let tpl = parse("verb = create\nother = stop-now").unwrap();
        assert_eq!(tpl.to_string(), "verb = create\nother = stop-now");
    }

    #[test]
    fn command_line_params() {
        let params = parse_params("name=web count=2 subnet=@main").unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params["subnet"], ParamValue::Alias("main".into()));
    }
}

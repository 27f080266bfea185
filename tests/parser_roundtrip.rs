use cloudplan::template::parse;
use proptest::prelude::*;

const COMMANDS: &[(&str, &str)] = &[
    ("create", "instance"),
    ("create", "subnet"),
    ("delete", "vpc"),
    ("update", "securitygroup"),
    ("attach", "volume"),
    ("check", "loadbalancer"),
    ("stop", "instance"),
];

fn scalar() -> impl Strategy<Value = String> {
    prop_oneof![
        (0i64..100_000).prop_map(|n| n.to_string()),
        "v[a-z0-9-]{0,8}",
        "r[a-z]{0,5}".prop_map(|r| format!("${}", r)),
        ("h[a-z]{0,4}", "[a-z]{1,4}").prop_map(|(a, b)| format!("{{{}.{}}}", a, b)),
        "a[a-z0-9-]{0,6}".prop_map(|a| format!("@{}", a)),
        ("q[a-z]{1,4}", "[a-z]{1,4}").prop_map(|(a, b)| format!("'{} {}'", a, b)),
        ("w[a-z]{1,4}", "[a-z]{1,4}").prop_map(|(a, b)| format!("\"{} {}\"", a, b)),
        ("s[a-z]{0,4}", "[a-z]{1,4}").prop_map(|(a, b)| format!("\"{}'{}\"", a, b)),
        (0u32..100_000).prop_map(|n| format!("'{}'", n)),
        (0u32..1000, 1u32..100).prop_map(|(i, f)| format!("{}.{}", i, f)),
        (0u32..1000, 1u32..100).prop_map(|(i, f)| format!("'{}.{}'", i, f)),
        any::<[u8; 4]>().prop_map(|o| format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])),
        (any::<[u8; 4]>(), 0u32..=32)
            .prop_map(|(o, p)| format!("{}.{}.{}.{}/{}", o[0], o[1], o[2], o[3], p)),
    ]
}

fn value() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => scalar(),
        1 => prop::collection::vec(scalar(), 2..4).prop_map(|items| format!("[{}]", items.join(","))),
        1 => ("v[a-z]{1,4}", "h[a-z]{1,4}").prop_map(|(a, h)| format!("{}+{{{}}}", a, h)),
    ]
}

fn command_line() -> impl Strategy<Value = String> {
    (
        0..COMMANDS.len(),
        prop::collection::btree_map("k[a-z]{0,5}", value(), 0..5),
        prop::option::of("d[a-z]{0,4}"),
    )
        .prop_map(|(idx, params, ident)| {
            let (action, entity) = COMMANDS[idx];
            let mut line = String::new();
            if let Some(ident) = ident {
                line.push_str(&format!("{} = ", ident));
            }
            line.push_str(&format!("{} {}", action, entity));
            for (k, v) in params {
                line.push_str(&format!(" {}={}", k, v));
            }
            line
        })
}

fn template_text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            4 => command_line(),
            1 => ("x[a-z]{0,4}", value()).prop_map(|(ident, v)| format!("{} = {}", ident, v)),
        ],
        1..6,
    )
    .prop_map(|lines| lines.join("\n"))
}

proptest! {
    #[test]
    fn printed_templates_parse_back_to_the_same_tree(text in template_text()) {
        let tpl = parse(&text).unwrap();
        let printed = tpl.to_string();
        let reparsed = parse(&printed).unwrap();
        prop_assert_eq!(&reparsed, &tpl, "printed as:\n{}", printed);
        prop_assert_eq!(reparsed.to_string(), printed);
    }

    #[test]
    fn clones_are_independent(text in template_text()) {
        let original = parse(&text).unwrap();
        let snapshot = original.to_string();
        let mut copy = original.clone();
        for node in copy.command_nodes_mut() {
            node.result = Some("changed".into());
            node.params.clear();
        }
        prop_assert_eq!(original.to_string(), snapshot);
        prop_assert!(original.command_nodes().all(|c| c.result.is_none()));
    }

    #[test]
    fn unknown_tokens_are_named(action in "xa[a-z]{1,5}", entity in "xe[a-z]{1,5}") {
        let err = parse(&format!("{} {}", action, entity)).unwrap_err().to_string();
        prop_assert!(err.contains(&format!("'{}'", action)), "{}", err);

        let err = parse(&format!("create {} name=x", entity)).unwrap_err().to_string();
        prop_assert!(err.contains(&format!("'{}'", entity)), "{}", err);
    }
}

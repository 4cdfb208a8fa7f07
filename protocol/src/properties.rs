use std::collections::BTreeMap;

/// Ordered so rendering a set of properties is deterministic
pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    Blank,
    Pair { key: &'a str, value: &'a str },
    Malformed,
}

/// Blank lines and lines starting with `//` carry no information. The value
/// is everything after the first `=` so values may contain `=` themselves.
pub fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") {
        return Line::Blank;
    }
    match line.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Line::Pair {
            key: key.trim(),
            value: value.trim(),
        },
        _ => Line::Malformed,
    }
}

/// `-p key=value` for every property, in key order
pub fn as_driver_args(props: &Properties) -> Vec<String> {
    props
        .iter()
        .flat_map(|(key, value)| ["-p".to_owned(), format!("{key}={value}")])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_keeps_later_equals_signs() {
        assert_eq!(
            parse_line("url=jdbc:oracle:thin:@host:1521:db?a=b"),
            Line::Pair {
                key: "url",
                value: "jdbc:oracle:thin:@host:1521:db?a=b"
            }
        );
    }

    #[test]
    fn comments_and_garbage() {
        assert_eq!(parse_line("   "), Line::Blank);
        assert_eq!(parse_line("// threadcount=4"), Line::Blank);
        assert_eq!(parse_line("threadcount"), Line::Malformed);
        assert_eq!(parse_line("=4"), Line::Malformed);
    }

    #[test]
    fn driver_args_are_sorted() {
        let props: Properties = [("b", "2"), ("a", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        assert_eq!(as_driver_args(&props), vec!["-p", "a=1", "-p", "b=2"]);
    }
}

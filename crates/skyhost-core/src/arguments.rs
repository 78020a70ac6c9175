//! Quote-aware command line splitting

/// Split a command line into the program and its arguments.
///
/// Double quotes group words, a backslash escapes the next character and
/// runs of spaces collapse.
pub fn split_arguments(line: &str) -> (String, Vec<String>) {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            ' ' | '\t' if !in_quotes => {
                if has_token {
                    parts.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        parts.push(current);
    }

    if parts.is_empty() {
        return (String::new(), Vec::new());
    }
    let cmd = parts.remove(0);
    (cmd, parts)
}

/// Join arguments back into one line, quoting those containing spaces
pub fn merge_arguments(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let quoted = arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"');
            if arg.contains(' ') && !quoted {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

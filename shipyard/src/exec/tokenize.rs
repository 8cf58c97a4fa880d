use shipyard_shared::errors::{ShipyardError, ShipyardResult};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a command line into argv the way a POSIX shell would, without
/// expansions: whitespace separates words, single quotes are literal, double
/// quotes allow `\"`, `\\`, `\$` and `` \` `` escapes, and a bare backslash
/// escapes the next character.
pub fn split_command(input: &str) -> ShipyardResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;
    let mut chars = input.chars();

    let dangling = || ShipyardError::Config(format!("trailing backslash in command: {}", input));

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                _ => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err(dangling()),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                '\\' => {
                    current.push(chars.next().ok_or_else(dangling)?);
                    in_token = true;
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(ShipyardError::Config(format!(
            "unterminated quote in command: {}",
            input
        )));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Inverse of [`split_command`]: quote each argument only when needed.
pub fn join_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

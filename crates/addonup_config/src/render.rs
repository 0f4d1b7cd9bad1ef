use crate::options::Options;

/// Error from `{key}` template substitution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unknown placeholder '{{{name}}}' in template")]
    UnknownKey { name: String },

    /// The named option exists but is a list or object, which has no single
    /// string form.
    #[error("placeholder '{{{name}}}' refers to a non-scalar option")]
    NotAScalar { name: String },

    #[error("unterminated placeholder in template")]
    Unterminated,

    #[error("single '}}' encountered in template")]
    StrayBrace,
}

/// Substitute `{key}` placeholders in a config template with option values.
///
/// This implements the contract the options schema documents for template
/// options like `homeserver.yaml`: `{key}` is replaced by the option's string
/// form, `{{` and `}}` are literal braces, and an unknown key is an error.
pub fn render(template: &str, options: &Options) -> Result<String, RenderError> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    output.push('{');
                    continue;
                }

                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(RenderError::Unterminated),
                    }
                }

                match options.get(&name) {
                    Some(value) => match crate::options::scalar_to_string(value) {
                        Some(s) => output.push_str(&s),
                        None => return Err(RenderError::NotAScalar { name }),
                    },
                    None => return Err(RenderError::UnknownKey { name }),
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    output.push('}');
                } else {
                    return Err(RenderError::StrayBrace);
                }
            }
            _ => output.push(c),
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(json: &str) -> Options {
        Options::from_json("/data/options.json", json).unwrap()
    }

    #[test]
    fn test_render_basic() {
        let opts = options(r#"{"server_name": "matrix.example.com", "port": 8008}"#);
        let out = render("server_name: {server_name}\nport: {port}\n", &opts).unwrap();
        assert_eq!(out, "server_name: matrix.example.com\nport: 8008\n");
    }

    #[test]
    fn test_render_brace_escapes() {
        let opts = options(r#"{"x": "y"}"#);
        let out = render("literal {{braces}} and {x}", &opts).unwrap();
        assert_eq!(out, "literal {braces} and y");
    }

    #[test]
    fn test_render_unknown_key() {
        let opts = options(r#"{}"#);
        let err = render("{nope}", &opts).unwrap_err();
        assert_eq!(
            err,
            RenderError::UnknownKey {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_render_unterminated() {
        let opts = options(r#"{}"#);
        assert_eq!(render("{oops", &opts).unwrap_err(), RenderError::Unterminated);
    }

    #[test]
    fn test_render_stray_brace() {
        let opts = options(r#"{}"#);
        assert_eq!(render("oops}", &opts).unwrap_err(), RenderError::StrayBrace);
    }

    #[test]
    fn test_render_non_scalar() {
        let opts = options(r#"{"list": ["a", "b"]}"#);
        assert_eq!(
            render("{list}", &opts).unwrap_err(),
            RenderError::NotAScalar {
                name: "list".to_string()
            }
        );
    }

    #[test]
    fn test_render_bool_lowercase() {
        let opts = options(r#"{"enabled": true}"#);
        assert_eq!(render("enabled = {enabled}", &opts).unwrap(), "enabled = true");
    }
}

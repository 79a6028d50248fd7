//! Template substitution (out of scope per spec.md §1, modeled as a narrow
//! collaborator trait). `{{name}}`-style variables are resolved against a
//! contact's built-in fields (`name`, `phone`) and `customFields`.

use crate::domain::Contact;
use crate::error::{BroadcastError, Result};

pub trait TemplateRenderer: Send + Sync {
    /// Validates `{{variable}}` syntax: braces balanced, no empty variable
    /// names. Does not require every variable to resolve for every contact —
    /// a missing field renders as an empty string.
    fn validate(&self, template: &str) -> Result<()>;
    fn render(&self, template: &str, contact: &Contact) -> String;
}

pub struct MiniTemplateRenderer;

impl TemplateRenderer for MiniTemplateRenderer {
    fn validate(&self, template: &str) -> Result<()> {
        let mut chars = template.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '{' {
                match chars.peek() {
                    Some((_, '{')) => {
                        chars.next();
                        let close = template[i..].find("}}").ok_or_else(|| {
                            BroadcastError::Validation(format!(
                                "unterminated template variable at offset {i}"
                            ))
                        })?;
                        let var_name = &template[i + 2..i + close];
                        if var_name.trim().is_empty() {
                            return Err(BroadcastError::Validation(format!(
                                "empty template variable at offset {i}"
                            )));
                        }
                    }
                    _ => continue,
                }
            }
        }
        Ok(())
    }

    fn render(&self, template: &str, contact: &Contact) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let var_name = after[..end].trim();
            out.push_str(&resolve(var_name, contact));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

fn resolve(var_name: &str, contact: &Contact) -> String {
    match var_name {
        "name" => contact.name.clone(),
        "phone" => contact.phone.clone(),
        other => contact.custom_fields.get(other).cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn contact() -> Contact {
        let mut custom_fields = HashMap::new();
        custom_fields.insert("city".to_string(), "Lagos".to_string());
        Contact {
            phone: "+15551234567".to_string(),
            name: "Ada".to_string(),
            custom_fields,
        }
    }

    #[test]
    fn renders_builtin_and_custom_fields() {
        let renderer = MiniTemplateRenderer;
        let rendered = renderer.render("Hi {{name}}, calling from {{city}}", &contact());
        assert_eq!(rendered, "Hi Ada, calling from Lagos");
    }

    #[test]
    fn missing_field_renders_empty() {
        let renderer = MiniTemplateRenderer;
        let rendered = renderer.render("Hi {{unknown}}", &contact());
        assert_eq!(rendered, "Hi ");
    }

    #[test]
    fn validate_rejects_unterminated_variable() {
        let renderer = MiniTemplateRenderer;
        assert!(renderer.validate("Hi {{name").is_err());
    }

    #[test]
    fn validate_rejects_empty_variable() {
        let renderer = MiniTemplateRenderer;
        assert!(renderer.validate("Hi {{}}").is_err());
    }

    #[test]
    fn validate_accepts_well_formed_template() {
        let renderer = MiniTemplateRenderer;
        assert!(renderer.validate("Hi {{name}}, you are {{age}}").is_ok());
    }
}

//! Variable substitution for command and file-name templates.
//!
//! Config templates use `{{ .Var }}` placeholders evaluated against the
//! validator context, e.g.
//! `{{ .Bin }} --ledger {{ .LedgerDir }} set-identity {{ .Identities.Active.KeyFile }}`.
//! Only variable substitution is supported; there are no conditionals or
//! loops. Unknown variables are configuration errors, not silent blanks.

use {
    crate::error::{Error, Result},
    std::collections::BTreeMap,
};

/// The variables a template may reference, keyed by their dotted name.
pub type TemplateVars = BTreeMap<&'static str, String>;

/// Expand every `{{ .Var }}` placeholder in `template` using `vars`.
pub fn expand(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| {
            Error::Configuration(format!("unterminated {{{{ in template: {template}"))
        })?;

        let name = after_open[..end].trim();
        let name = name.strip_prefix('.').ok_or_else(|| {
            Error::Configuration(format!("template variable must start with '.': {name}"))
        })?;

        let value = vars.get(name).ok_or_else(|| {
            Error::Configuration(format!("unknown template variable .{name} in: {template}"))
        })?;
        out.push_str(value);

        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vars() -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("Bin", "agave-validator".to_string());
        vars.insert("LedgerDir", "/mnt/ledger".to_string());
        vars.insert(
            "Identities.Active.PubKey",
            "7cVfgArCheMR6Cs4t6vz5rfnqd56vymq4pnzGMZQG4r9".to_string(),
        );
        vars.insert(
            "Identities.Passive.KeyFile",
            "/home/sol/passive.json".to_string(),
        );
        vars
    }

    #[test]
    fn test_expand_set_identity_command() {
        let expanded = expand(
            "{{ .Bin }} --ledger {{ .LedgerDir }} set-identity {{ .Identities.Passive.KeyFile }}",
            &test_vars(),
        )
        .unwrap();
        assert_eq!(
            expanded,
            "agave-validator --ledger /mnt/ledger set-identity /home/sol/passive.json"
        );
    }

    #[test]
    fn test_expand_tower_file_name() {
        let expanded = expand("tower-1_9-{{ .Identities.Active.PubKey }}.bin", &test_vars()).unwrap();
        assert_eq!(
            expanded,
            "tower-1_9-7cVfgArCheMR6Cs4t6vz5rfnqd56vymq4pnzGMZQG4r9.bin"
        );
    }

    #[test]
    fn test_expand_no_placeholders_is_identity() {
        assert_eq!(expand("plain text", &test_vars()).unwrap(), "plain text");
    }

    #[test]
    fn test_expand_unknown_variable_errors() {
        let err = expand("{{ .Nope }}", &test_vars()).unwrap_err();
        assert!(err.to_string().contains(".Nope"));
    }

    #[test]
    fn test_expand_unterminated_errors() {
        assert!(expand("{{ .Bin", &test_vars()).is_err());
    }

    #[test]
    fn test_expand_requires_leading_dot() {
        assert!(expand("{{ Bin }}", &test_vars()).is_err());
    }
}

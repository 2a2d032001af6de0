//! Native proxy configuration text.
//!
//! Rules are rendered through a minijinja template; the built-in one emits
//! an nginx `server` block meant to be included from the `http` context.

use minijinja::{Environment, context};

use super::{ProxyConfig, ProxyError};

pub const DEFAULT_TEMPLATE: &str = r#"# Managed by steward. Manual edits are overwritten on the next deployment.
{% for rule in rules %}
upstream steward_{{ rule.service | replace(".", "_") | replace("-", "_") }} {
    server {{ rule.upstream }};
}
{% endfor %}
server {
    listen 80;
{% for rule in rules %}
    location {{ rule.route_prefix }} {
        proxy_pass http://steward_{{ rule.service | replace(".", "_") | replace("-", "_") }};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }
{% endfor %}
}
"#;

const FORBIDDEN: &[char] = &[';', '{', '}', '#', '"', '\''];

/// Checks that hold regardless of the proxy behind the template.
pub fn check_structure(config: &ProxyConfig) -> Result<(), ProxyError> {
    let mut seen = std::collections::HashSet::new();
    for rule in &config.rules {
        let prefix = &rule.route_prefix;
        if !prefix.starts_with('/') {
            return Err(ProxyError::ConfigSyntax(format!(
                "route prefix '{prefix}' must start with '/'"
            )));
        }
        if prefix.chars().any(|c| c.is_whitespace() || FORBIDDEN.contains(&c)) {
            return Err(ProxyError::ConfigSyntax(format!(
                "route prefix '{prefix}' contains a reserved character"
            )));
        }
        if !seen.insert(prefix.as_str()) {
            return Err(ProxyError::ConfigSyntax(format!(
                "route prefix '{prefix}' is used by more than one service"
            )));
        }
        check_upstream(&rule.upstream)?;
    }
    Ok(())
}

fn check_upstream(upstream: &str) -> Result<(), ProxyError> {
    let invalid = || ProxyError::ConfigSyntax(format!("upstream '{upstream}' is not host:port"));
    let (host, port) = upstream.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty()
        || host
            .chars()
            .any(|c| c.is_whitespace() || FORBIDDEN.contains(&c) || c == '/')
    {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

pub fn render(template: &str, config: &ProxyConfig) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    env.add_template("proxy", template)?;
    env.get_template("proxy")?
        .render(context! { rules => &config.rules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyRule;

    fn rule(service: &str, prefix: &str, upstream: &str) -> ProxyRule {
        ProxyRule {
            service: service.to_string(),
            route_prefix: prefix.to_string(),
            upstream: upstream.to_string(),
        }
    }

    #[test]
    fn test_default_template_renders_every_rule() {
        let config = ProxyConfig {
            rules: vec![
                rule("backend", "/api", "10.0.0.2:8000"),
                rule("web-ui", "/", "10.0.0.3:3000"),
            ],
        };
        let text = render(DEFAULT_TEMPLATE, &config).unwrap();
        assert!(text.contains("upstream steward_backend {\n    server 10.0.0.2:8000;"));
        assert!(text.contains("location /api {\n        proxy_pass http://steward_backend;"));
        assert!(text.contains("proxy_pass http://steward_web_ui;"));
        assert!(text.find("location /api").unwrap() < text.find("location / ").unwrap());
    }

    #[test]
    fn test_structure_rejects_bad_rules() {
        let cases = [
            rule("a", "api", "10.0.0.2:80"),
            rule("a", "/api; return 200", "10.0.0.2:80"),
            rule("a", "/api", "10.0.0.2"),
            rule("a", "/api", "10.0.0.2:http"),
            rule("a", "/api", ":80"),
        ];
        for case in cases {
            let config = ProxyConfig { rules: vec![case] };
            assert!(
                matches!(check_structure(&config), Err(ProxyError::ConfigSyntax(_))),
                "{config:?}"
            );
        }

        let duplicate = ProxyConfig {
            rules: vec![rule("a", "/x", "10.0.0.2:80"), rule("b", "/x", "10.0.0.3:80")],
        };
        assert!(check_structure(&duplicate).is_err());
    }

    #[test]
    fn test_strict_template_rejects_unknown_fields() {
        let config = ProxyConfig {
            rules: vec![rule("a", "/", "10.0.0.2:80")],
        };
        assert!(render("{% for r in rules %}{{ r.weight }}{% endfor %}", &config).is_err());
    }
}

use serde_json::Value;

use crate::{
    config::ExecutionConfig,
    error::Error,
    types::{Action, ExecutionRequest, Language},
};

/// Schema-checks an untyped request body, reporting every violation at once.
pub fn parse_request(raw: &Value, config: &ExecutionConfig) -> Result<ExecutionRequest, Error> {
    let Some(body) = raw.as_object() else {
        return Err(Error::Validation(vec![
            "request body must be a JSON object".to_string(),
        ]));
    };

    let mut violations = Vec::new();

    let code = match body.get("code") {
        Some(Value::String(code)) => {
            violations.extend(code_violations(code, config.max_code_length));
            Some(code)
        }
        Some(Value::Null) | None => {
            violations.push("code is required".to_string());
            None
        }
        Some(_) => {
            violations.push("code must be a string".to_string());
            None
        }
    };

    let language = match body.get("language").and_then(Value::as_str) {
        Some(name) => name.parse::<Language>().ok(),
        None => None,
    };
    if language.is_none() {
        violations.push(format!(
            "language must be one of: {}",
            join_names(Language::ALL.iter().map(Language::as_str))
        ));
    }

    let action = match body.get("action") {
        Some(Value::Null) | None => None,
        Some(value) => {
            let parsed = value.as_str().and_then(|name| name.parse::<Action>().ok());
            if parsed.is_none() {
                violations.push(format!(
                    "action must be one of: {}",
                    join_names(Action::ALL.iter().map(Action::as_str))
                ));
            }
            parsed
        }
    };

    match (code, language) {
        (Some(code), Some(language)) if violations.is_empty() => Ok(ExecutionRequest {
            code: code.clone(),
            language,
            action,
        }),
        _ => Err(Error::Validation(violations)),
    }
}

/// Re-checks a typed request against the configured code limits.
pub fn validate_request(request: &ExecutionRequest, config: &ExecutionConfig) -> Result<(), Error> {
    let violations = code_violations(&request.code, config.max_code_length);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(violations))
    }
}

fn code_violations(code: &str, max_code_length: usize) -> Vec<String> {
    let mut violations = Vec::new();
    if code.is_empty() {
        violations.push("code must not be empty".to_string());
    } else if code.chars().count() > max_code_length {
        violations.push(format!(
            "code exceeds maximum length of {} characters",
            max_code_length
        ));
    }
    violations
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

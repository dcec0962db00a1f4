use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported programming languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Cpp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }

    /// Identifier the execution backend knows this language by
    pub fn backend_id(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "cpp" => Ok(Language::Cpp),
            _ => Err(format!("Unsupported language: {}", s)),
        }
    }
}

/// What the caller wants done with the submitted code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Compile,
    Run,
    #[default]
    CompileAndRun,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Compile, Action::Run, Action::CompileAndRun];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Compile => "compile",
            Action::Run => "run",
            Action::CompileAndRun => "compile-and-run",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(Action::Compile),
            "run" => Ok(Action::Run),
            "compile-and-run" => Ok(Action::CompileAndRun),
            _ => Err(format!("Unsupported action: {}", s)),
        }
    }
}

/// Code execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source code to execute
    pub code: String,
    /// Programming language
    pub language: Language,
    /// Requested action, `compile-and-run` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            action: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn effective_action(&self) -> Action {
        self.action.unwrap_or_default()
    }
}

/// Execution result returned to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time in milliseconds from request entry to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled: Option<bool>,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Output of one backend stage (compile or run)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Exit code; a process killed by a signal reports none
    #[serde(default = "killed", deserialize_with = "exit_code")]
    pub code: i32,
    #[serde(default, deserialize_with = "nullable_string")]
    pub stdout: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub stderr: String,
}

/// Raw response shape of the execution backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<StageOutput>,
    pub run: StageOutput,
}

/// Parsed outcome of a full run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Parsed outcome of a compile-only check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub success: bool,
    pub error: Option<String>,
}

fn killed() -> i32 {
    -1
}

fn exit_code<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i32>::deserialize(deserializer)?.unwrap_or_else(killed))
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_wire_names() {
        let action: Action = serde_json::from_value(json!("compile-and-run")).unwrap();
        assert_eq!(action, Action::CompileAndRun);
        assert_eq!("run".parse::<Action>().unwrap(), Action::Run);
        assert!("debug".parse::<Action>().is_err());
    }

    #[test]
    fn test_default_action() {
        let request = ExecutionRequest::new(Language::Cpp, "int main() {}");
        assert_eq!(request.effective_action(), Action::CompileAndRun);
        let request = request.with_action(Action::Compile);
        assert_eq!(request.effective_action(), Action::Compile);
    }

    #[test]
    fn test_result_serializes_camel_case_and_skips_absent_fields() {
        let result = ExecutionResult {
            success: true,
            output: "hi\n".to_string(),
            execution_time: Some(12),
            ..Default::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({ "success": true, "output": "hi\n", "executionTime": 12 })
        );
    }

    #[test]
    fn test_stage_output_tolerates_missing_and_null_fields() {
        let outcome: BackendOutcome = serde_json::from_value(json!({
            "run": { "code": null, "stdout": "partial", "stderr": null, "signal": "SIGKILL" }
        }))
        .unwrap();
        assert!(outcome.compile.is_none());
        assert_eq!(outcome.run.code, -1);
        assert_eq!(outcome.run.stdout, "partial");
        assert_eq!(outcome.run.stderr, "");

        let stage: StageOutput = serde_json::from_value(json!({ "stdout": "x" })).unwrap();
        assert_eq!(stage.code, -1);
    }
}

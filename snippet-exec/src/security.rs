//! Static screening of submitted source code.
//!
//! A textual denylist applied before anything leaves the gateway. It is one
//! layer only: the execution backend's sandbox is what actually contains the
//! program.

use regex::Regex;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::LazyLock;
use tracing::warn;

use crate::{error::Error, types::Language};

/// A denylisted construct, optionally forgiven when the source also shows
/// one of a set of safe usages.
struct DenyRule {
    pattern: Regex,
    message: &'static str,
    allow_if_any: &'static [&'static str],
}

impl DenyRule {
    fn new(pattern: &str, message: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("denylist pattern must compile"),
            message,
            allow_if_any: &[],
        }
    }

    fn unless_any(mut self, allow_if_any: &'static [&'static str]) -> Self {
        self.allow_if_any = allow_if_any;
        self
    }

    /// Deny first, then apply the override for this rule only.
    fn violated_by(&self, code: &str) -> bool {
        self.pattern.is_match(code) && !self.allow_if_any.iter().any(|safe| code.contains(safe))
    }
}

/// Modules listed before the one a rule looks for, as in `import a, b as c, x`
const IMPORT_LIST_HEAD: &str = r"(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*";

const SAFE_OS_CALLS: &[&str] = &["os.path.exists", "os.path.isfile", "os.path.isdir"];

static PYTHON_RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    vec![
        DenyRule::new(
            &format!(r"(?m)\bimport\s+{}os(?:\s+as\s+\w+)?\s*(?:,|$)", IMPORT_LIST_HEAD),
            "Potentially unsafe code detected: os import",
        )
        .unless_any(SAFE_OS_CALLS),
        DenyRule::new(
            &format!(r"\b(?:from\s+|import\s+{})subprocess\b", IMPORT_LIST_HEAD),
            "Potentially unsafe code detected: subprocess import",
        ),
        DenyRule::new(
            &format!(r"\b(?:from\s+|import\s+{})sys\b", IMPORT_LIST_HEAD),
            "Potentially unsafe code detected: sys import",
        ),
        DenyRule::new(
            r"__import__",
            "Potentially unsafe code detected: dynamic import",
        ),
        DenyRule::new(r"\beval\s*\(", "Potentially unsafe code detected: eval()"),
        DenyRule::new(r"\bexec\s*\(", "Potentially unsafe code detected: exec()"),
        DenyRule::new(
            r"\bopen\s*\(",
            "File operations must be preceded by existence checks",
        )
        .unless_any(&["os.path.exists"]),
        DenyRule::new(r"\bfile\s*\(", "Potentially unsafe code detected: file()"),
        DenyRule::new(r"\binput\s*\(", "Potentially unsafe code detected: input()"),
        DenyRule::new(
            r"\braw_input\s*\(",
            "Potentially unsafe code detected: raw_input()",
        ),
        DenyRule::new(r"\bsystem\s*\(", "Potentially unsafe code detected: system()"),
        DenyRule::new(r"\bpopen\s*\(", "Potentially unsafe code detected: popen()"),
        DenyRule::new(r"\bspawn\w*\s*\(", "Potentially unsafe code detected: spawn()"),
        DenyRule::new(r"\bfork\s*\(", "Potentially unsafe code detected: fork()"),
        DenyRule::new(r"\bexecve\s*\(", "Potentially unsafe code detected: execve()"),
    ]
});

const DANGEROUS_INCLUDES: &[&str] = &[
    "cstdlib",
    "stdlib.h",
    "unistd.h",
    "sys/wait.h",
    "process.h",
];

static CPP_INCLUDE_RULES: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    DANGEROUS_INCLUDES
        .iter()
        .map(|header| {
            let pattern = format!(r"#\s*include\s*<{}>", regex::escape(header));
            (
                Regex::new(&pattern).expect("include pattern must compile"),
                format!("Dangerous include detected: <{}>", header),
            )
        })
        .collect()
});

/// Screens `code` and hands it back untouched when nothing is denylisted.
pub fn screen_code(code: &str, language: Language) -> Result<&str, Error> {
    let verdict = match language {
        Language::Python => screen_python(code),
        Language::Cpp => screen_cpp(code),
    };

    if let Err(e) = &verdict {
        warn!(%language, reason = %e, "Rejected submitted code");
    }

    verdict.map(|()| code)
}

fn screen_python(code: &str) -> Result<(), Error> {
    let stripped = strip_python_comments(code);

    match PYTHON_RULES.iter().find(|rule| rule.violated_by(&stripped)) {
        Some(rule) => Err(Error::SecurityViolation(rule.message.to_string())),
        None => Ok(()),
    }
}

fn screen_cpp(code: &str) -> Result<(), Error> {
    let stripped = strip_cpp_comments(code);

    for (pattern, message) in CPP_INCLUDE_RULES.iter() {
        if pattern.is_match(&stripped) {
            return Err(Error::SecurityViolation(message.clone()));
        }
    }

    if stripped.contains("system(") || stripped.contains("exec(") {
        return Err(Error::SecurityViolation(
            "System calls are not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Drops `#` comments that sit outside string literals.
fn strip_python_comments(code: &str) -> String {
    code.lines()
        .map(|line| {
            let mut quote: Option<char> = None;
            let mut escaped = false;
            for (idx, ch) in line.char_indices() {
                match quote {
                    Some(_) if escaped => escaped = false,
                    Some(_) if ch == '\\' => escaped = true,
                    Some(q) if ch == q => quote = None,
                    Some(_) => {}
                    None if ch == '\'' || ch == '"' => quote = Some(ch),
                    None if ch == '#' => return &line[..idx],
                    None => {}
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drops `//` and `/* */` comments that sit outside string and char literals.
fn strip_cpp_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            out.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if ch == q || ch == '\n' {
                quote = None;
            }
            continue;
        }

        match (ch, chars.peek()) {
            ('/', Some('/')) => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    if next == '\n' {
                        out.push('\n');
                    }
                    prev = next;
                }
                out.push(' ');
            }
            ('"', _) if has_raw_string_prefix(&out) => {
                out.push(ch);
                if !copy_raw_string(&mut chars, &mut out) {
                    quote = Some(ch);
                }
            }
            // Digit separator, as in 1'000'000
            ('\'', _) if in_number_literal(&out) => out.push(ch),
            ('"', _) | ('\'', _) => {
                quote = Some(ch);
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    out
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// True when `scanned` ends with `R`, `u8R`, `uR`, `UR` or `LR` as a whole token.
fn has_raw_string_prefix(scanned: &str) -> bool {
    let Some(head) = scanned.strip_suffix('R') else {
        return false;
    };
    ["u8", "u", "U", "L", ""].iter().any(|encoding| {
        head.strip_suffix(*encoding)
            .is_some_and(|rest| !rest.ends_with(is_ident_char))
    })
}

/// True when the last token of `scanned` starts with a digit.
fn in_number_literal(scanned: &str) -> bool {
    let token_start = scanned
        .char_indices()
        .rev()
        .find(|&(_, ch)| !(is_ident_char(ch) || ch == '.' || ch == '\''))
        .map_or(0, |(idx, ch)| idx + ch.len_utf8());
    scanned[token_start..]
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_digit())
}

/// Copies a raw string literal `R"delim( ... )delim"` through its terminator.
/// The opening quote has already been copied. Returns false, having copied
/// nothing, when no valid delimiter follows.
fn copy_raw_string(chars: &mut Peekable<Chars<'_>>, out: &mut String) -> bool {
    let mut delimiter = String::new();
    loop {
        match chars.peek() {
            Some('(') => break,
            Some(&next)
                if delimiter.len() < 16
                    && !next.is_whitespace()
                    && !matches!(next, ')' | '\\' | '"') =>
            {
                delimiter.push(next);
                chars.next();
            }
            _ => {
                out.push_str(&delimiter);
                return false;
            }
        }
    }

    out.push_str(&delimiter);
    if let Some(open) = chars.next() {
        out.push(open);
    }

    let terminator = format!("){}\"", delimiter);
    let body_start = out.len();
    for next in chars.by_ref() {
        out.push(next);
        if next == '"' && out[body_start..].ends_with(&terminator) {
            break;
        }
    }
    true
}

//! Error Types
//!
//! Host-side errors plus the structured form of an uncaught script exception.

use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::engine::{EnvId, IsolateState};

/// Result type alias
pub type Result<T> = std::result::Result<T, ScripterError>;

// ─────────────────────────────────────────────────────────────────────────────
// Host Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur while hosting scripts
#[derive(Debug, thiserror::Error)]
pub enum ScripterError {
    #[error("Platform is already initialized on this thread")]
    PlatformInitialized,

    #[error("Isolate is {actual:?}, expected {expected:?}")]
    IsolateState {
        expected: IsolateState,
        actual: IsolateState,
    },

    #[error("Script environment {0} is already enabled")]
    EnvAlreadyEnabled(EnvId),

    #[error("Script environment {0} is not the active environment")]
    EnvNotActive(EnvId),

    #[error("No script environment is active")]
    NoActiveEnv,

    #[error("Engine has been shut down")]
    EngineGone,

    #[error("Failed to read script {}: {source}", path.display())]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Script(Box<ScriptException>),

    #[error("Circular import of module '{0}'")]
    CircularImport(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("JavaScript runtime error: {0}")]
    Runtime(#[from] rquickjs::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ScripterError {
    /// The script exception behind this error, if it came from running script code
    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            ScripterError::Script(exception) => Some(exception),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Exceptions
// ─────────────────────────────────────────────────────────────────────────────

/// One frame of a script call stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, `<eval>` or `<anonymous>` for top-level code
    pub function: String,
    /// Script the frame belongs to, `None` for native frames
    pub script: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.script {
            None => write!(f, "{} (native)", self.function),
            Some(script) => {
                write!(f, "{} ({}", self.function, script)?;
                if let Some(line) = self.line {
                    write!(f, ":{}", line)?;
                }
                if let Some(column) = self.column {
                    write!(f, ":{}", column)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// An exception raised by script code and caught at an exception-check boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    /// Error class name such as `TypeError`, if the thrown value was an error object
    pub name: Option<String>,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// The offending line of source text
    pub source_line: Option<String>,
    pub frames: Vec<StackFrame>,
}

impl ScriptException {
    /// Build an exception from a thrown message and its raw stack text
    pub fn new(name: Option<String>, message: String, stack: Option<&str>) -> Self {
        let frames = stack.map(parse_stack).unwrap_or_default();
        let origin = frames.iter().find(|frame| frame.script.is_some());

        Self {
            name,
            message,
            file: origin.and_then(|frame| frame.script.clone()),
            line: origin.and_then(|frame| frame.line),
            column: origin.and_then(|frame| frame.column),
            source_line: None,
            frames,
        }
    }

    /// The first frame that belongs to a script rather than native code
    pub fn script_frame(&self) -> Option<&StackFrame> {
        self.frames.iter().find(|frame| frame.script.is_some())
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(file) = &self.file {
            write!(f, " at {}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
            }
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

/// Parse a QuickJS backtrace into frames.
///
/// Lines look like `at name (file:line[:column])`, `at name (native)` or,
/// for parse errors, `at file:line`.
pub fn parse_stack(stack: &str) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .map(parse_frame)
        .collect()
}

fn parse_frame(frame: &str) -> StackFrame {
    let (function, location) = match (frame.find(" ("), frame.ends_with(')')) {
        (Some(open), true) => (&frame[..open], &frame[open + 2..frame.len() - 1]),
        _ => ("<anonymous>", frame),
    };

    if location == "native" {
        return StackFrame {
            function: function.to_string(),
            script: None,
            line: None,
            column: None,
        };
    }

    let (script, line, column) = split_location(location);
    StackFrame {
        function: function.to_string(),
        script: Some(script.to_string()),
        line,
        column,
    }
}

fn split_location(location: &str) -> (&str, Option<u32>, Option<u32>) {
    let Some((rest, last)) = location.rsplit_once(':') else {
        return (location, None, None);
    };
    let Ok(last) = last.parse::<u32>() else {
        return (location, None, None);
    };

    match rest.rsplit_once(':') {
        Some((script, line)) => match line.parse::<u32>() {
            Ok(line) => (script, Some(line), Some(last)),
            Err(_) => (rest, Some(last), None),
        },
        None => (rest, Some(last), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_frames() {
        let frames = parse_stack(
            "    at importModule (native)\n    at main (/tmp/app/main.js:3)\n    at <eval> (/tmp/app/main.js:7:5)\n",
        );

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function, "importModule");
        assert_eq!(frames[0].script, None);
        assert_eq!(frames[1].script.as_deref(), Some("/tmp/app/main.js"));
        assert_eq!(frames[1].line, Some(3));
        assert_eq!(frames[1].column, None);
        assert_eq!(frames[2].function, "<eval>");
        assert_eq!(frames[2].line, Some(7));
        assert_eq!(frames[2].column, Some(5));
    }

    #[test]
    fn test_parse_bare_location() {
        let frames = parse_stack("    at /tmp/broken.js:2\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function, "<anonymous>");
        assert_eq!(frames[0].script.as_deref(), Some("/tmp/broken.js"));
        assert_eq!(frames[0].line, Some(2));
    }

    #[test]
    fn test_exception_location_skips_native_frames() {
        let exception = ScriptException::new(
            Some("TypeError".to_string()),
            "bad".to_string(),
            Some("    at write (native)\n    at run (/srv/job.js:12:3)\n"),
        );

        assert_eq!(exception.file.as_deref(), Some("/srv/job.js"));
        assert_eq!(exception.line, Some(12));
        assert_eq!(exception.column, Some(3));
        assert_eq!(exception.script_frame().map(|f| f.function.as_str()), Some("run"));
        assert_eq!(exception.to_string(), "TypeError: bad at /srv/job.js:12:3");
    }

    #[test]
    fn test_exception_without_stack() {
        let exception = ScriptException::new(None, "boom".to_string(), None);
        assert!(exception.frames.is_empty());
        assert_eq!(exception.file, None);
        assert_eq!(exception.to_string(), "boom");
    }

    #[test]
    fn test_frame_display() {
        let frame = StackFrame {
            function: "main".to_string(),
            script: Some("a.js".to_string()),
            line: Some(4),
            column: Some(2),
        };
        assert_eq!(frame.to_string(), "main (a.js:4:2)");
    }
}

// Copyright 2025 Cornell University
// released under MIT License

use std::io::Write;

use clap::ColorChoice;
use codespan_reporting::diagnostic::{
    Diagnostic as CodespanDiagnostic, Label as CodespanLabel, LabelStyle, Severity,
};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{Buffer, Color, ColorSpec, WriteColor};

use crate::errors::{CompileError, CompileErrorKind};

/// Severity of diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

impl Level {
    fn severity(self) -> Severity {
        match self {
            Level::Error => Severity::Error,
            Level::Warning => Severity::Warning,
        }
    }

    fn color(self) -> Color {
        match self {
            Level::Error => Color::Red,
            Level::Warning => Color::Yellow,
        }
    }
}

/// A part of a source file the diagnostic points at
#[derive(Debug, Clone, PartialEq, Eq)]
struct Label {
    message: String,
    range: (usize, usize),
}

impl Label {
    fn to_codespan_label(&self, fileid: usize) -> CodespanLabel<usize> {
        CodespanLabel::new(LabelStyle::Primary, fileid, self.range.0..self.range.1)
            .with_message(self.message.clone())
    }
}

struct Diagnostic {
    message: String,
    level: Level,
    location: Option<(usize, Label)>,
}

impl Diagnostic {
    fn emit(&self, buffer: &mut Buffer, files: &SimpleFiles<String, String>) -> std::io::Result<()> {
        if let Some((fileid, label)) = &self.location {
            let diagnostic = CodespanDiagnostic::new(self.level.severity())
                .with_message(&self.message)
                .with_labels(vec![label.to_codespan_label(*fileid)]);
            let config = term::Config::default();
            term::emit(buffer, &config, files, &diagnostic).map_err(std::io::Error::other)
        } else {
            buffer.set_color(ColorSpec::new().set_bold(true).set_fg(Some(self.level.color())))?;
            write!(buffer, "{:?}", self.level)?;
            buffer.set_color(ColorSpec::new().set_bold(true))?;
            writeln!(buffer, ": {}", self.message)?;
            buffer.set_color(&ColorSpec::new())
        }
    }
}

/// Collects and prints compiler diagnostics. Everything printed is also
/// kept in `error_string` so that tests can inspect it.
pub struct DiagnosticHandler {
    files: SimpleFiles<String, String>,
    error_string: String,
    /// `color_choice` indicates whether to emit messages w/ ANSI colors
    color_choice: ColorChoice,
    /// Print to stderr, off in tests
    echo: bool,
}

impl Default for DiagnosticHandler {
    /// Default `DiagnosticHandler` does not emit colored messages
    fn default() -> Self {
        Self::new(ColorChoice::Never)
    }
}

impl DiagnosticHandler {
    pub fn new(color_choice: ColorChoice) -> Self {
        Self {
            files: SimpleFiles::new(),
            error_string: String::new(),
            color_choice,
            echo: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn create_buffer(&self) -> Buffer {
        if self.color_choice == ColorChoice::Never {
            Buffer::no_color()
        } else {
            Buffer::ansi()
        }
    }

    pub fn add_file(&mut self, name: String, content: String) -> usize {
        self.files.add(name, content)
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        let mut buffer = self.create_buffer();
        if diagnostic.emit(&mut buffer, &self.files).is_err() {
            // fall back to the bare message
            buffer.clear();
            let _ = writeln!(buffer, "{:?}: {}", diagnostic.level, diagnostic.message);
        }
        let msg = String::from_utf8_lossy(buffer.as_slice()).to_string();
        if self.echo {
            eprint!("{}", msg);
        }
        self.error_string.push_str(&msg);
    }

    pub fn emit(&mut self, message: &str, level: Level) {
        self.report(Diagnostic {
            message: message.to_string(),
            level,
            location: None,
        });
    }

    /// Reports a composition failure. The location in the model file is
    /// recovered by searching for the names recorded in the error context.
    pub fn emit_compile_error(&mut self, fileid: Option<usize>, err: &CompileError) {
        let location = fileid.and_then(|id| {
            let source = self.files.get(id).ok()?.source();
            let range = locate(source, err)?;
            Some((
                id,
                Label {
                    message: label_message(err),
                    range,
                },
            ))
        });
        self.report(Diagnostic {
            message: err.to_string(),
            level: Level::Error,
            location,
        });
    }

    /// Reports a malformed input document at the position serde gives
    pub fn emit_json_error(&mut self, fileid: usize, err: &serde_json::Error) {
        let location = self.files.get(fileid).ok().map(|file| {
            let start = offset_of(file.source(), err.line(), err.column());
            let end = (start + 1).min(file.source().len()).max(start);
            (
                fileid,
                Label {
                    message: format!("{:?}", err.classify()).to_lowercase(),
                    range: (start, end),
                },
            )
        });
        self.report(Diagnostic {
            message: err.to_string(),
            level: Level::Error,
            location,
        });
    }
}

fn label_message(err: &CompileError) -> String {
    match &err.kind {
        CompileErrorKind::Structural(_) => "structural error".to_string(),
        CompileErrorKind::Type(_) => "type error".to_string(),
        CompileErrorKind::Parse(e) => e.message.clone(),
    }
}

/// Byte offset of a 1-based line and column
fn offset_of(source: &str, line: usize, column: usize) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(source.len())
}

/// Range of the first occurrence of `"needle"` at or after `from`, quotes
/// excluded
fn find_quoted(source: &str, from: usize, needle: &str) -> Option<(usize, usize)> {
    let quoted = format!("\"{}\"", needle);
    let start = from + source.get(from..)?.find(&quoted)? + 1;
    Some((start, start + needle.len()))
}

/// Narrows down automaton, state and offending expression in turn. Stops
/// at the innermost part that can still be found.
fn locate(source: &str, err: &CompileError) -> Option<(usize, usize)> {
    let mut range = find_quoted(source, 0, err.context.automaton.as_deref()?)?;
    if let Some(state) = &err.context.state {
        match find_quoted(source, range.1, state) {
            Some(r) => range = r,
            None => return Some(range),
        }
    }
    if let CompileErrorKind::Parse(e) = &err.kind {
        if let Some(start) = source.get(range.1..).and_then(|s| s.find(&e.input)) {
            let start = range.1 + start;
            range = (start, start + e.input.len());
        }
    }
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ParseError, StructuralError, WithContext};
    use strip_ansi_escapes::strip_str;

    const MODEL: &str = r#"{"automata": [
  {"name": "talker", "states": [{"name": "run"}]},
  {"name": "listener", "states": [{"name": "idle", "transitions": [
    {"guard": "x >", "target": "idle"}]}]}
]}
"#;

    #[test]
    fn locates_errors_in_the_model() {
        let err: CompileError = ParseError {
            input: "x >".to_string(),
            message: "expected an operand".to_string(),
        }
        .into();
        let err = Err::<(), _>(err).at_state("idle").in_automaton("listener").unwrap_err();
        let (start, end) = locate(MODEL, &err).unwrap();
        assert_eq!(&MODEL[start..end], "x >");
        assert!(start > MODEL.find("listener").unwrap());

        let unknown: CompileError = StructuralError::unknown_state("nowhere").into();
        let unknown = unknown.at_state("nowhere").in_automaton("talker");
        let (start, end) = locate(MODEL, &unknown).unwrap();
        assert_eq!(&MODEL[start..end], "talker");

        assert_eq!(locate(MODEL, &StructuralError::unknown_state("x").into()), None);
    }

    #[test]
    fn emitted_messages() {
        let mut handler = DiagnosticHandler::new(ColorChoice::Never).quiet();
        let file = handler.add_file("model.json".to_string(), MODEL.to_string());
        let err: CompileError = StructuralError::unknown_state("nowhere").into();
        handler.emit_compile_error(Some(file), &err.in_automaton("talker"));
        handler.emit("exploration stopped early", Level::Warning);
        let content = strip_str(handler.error_string());
        assert!(content.starts_with(
            "error: Structural error: Transition targets unknown state `nowhere` (automaton `talker`)"
        ));
        assert!(content.contains("model.json:2:13"));
        assert!(content.contains("^^^^^^ structural error"));
        assert!(content.ends_with("Warning: exploration stopped early\n"));
    }

    #[test]
    fn json_errors() {
        let text = "{\n  \"automata\": [,]\n}";
        let mut handler = DiagnosticHandler::default().quiet();
        let file = handler.add_file("bad.json".to_string(), text.to_string());
        let err = serde_json::from_str::<serde_json::Value>(text).unwrap_err();
        handler.emit_json_error(file, &err);
        assert!(handler.error_string().contains("bad.json:2:"));
        assert_eq!(offset_of(text, 2, 3), 4);
    }
}

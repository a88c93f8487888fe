//! Template interpolation
//!
//! The builder accepts a sequence of literal fragments and typed interpolated
//! values, walks them, and lowers the result to a [`Command`] whose value
//! tokens are quoted at render time. Interpolation happens here, never in
//! adapters.

use std::collections::BTreeMap;

use crate::command::{Command, Token};
use crate::error::{Error, Result};

/// A value interpolated into a template.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    /// One shell-quoted token.
    Str(String),
    /// Rejected in command position; feed byte buffers through `stdin`.
    Bytes(Vec<u8>),
    /// Expands to N quoted tokens.
    List(Vec<String>),
    /// Expands to `--key value` pairs in key order; `true` emits a bare flag,
    /// `false`/absent is omitted.
    Flags(BTreeMap<String, FlagValue>),
    /// A nested command, captured as the pipe source.
    Command(Box<Command>),
    /// Caller-trusted text spliced in without quoting.
    Raw(String),
    /// An absent value; always an error.
    Missing,
}

#[derive(Debug, Clone)]
pub enum FlagValue {
    Value(String),
    Switch(bool),
    Absent,
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::Str(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::Str(value)
    }
}

impl From<Vec<String>> for TemplateValue {
    fn from(value: Vec<String>) -> Self {
        TemplateValue::List(value)
    }
}

impl From<Vec<u8>> for TemplateValue {
    fn from(value: Vec<u8>) -> Self {
        TemplateValue::Bytes(value)
    }
}

impl From<Command> for TemplateValue {
    fn from(value: Command) -> Self {
        TemplateValue::Command(Box::new(value))
    }
}

impl<T: Into<TemplateValue>> From<Option<T>> for TemplateValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => TemplateValue::Missing,
        }
    }
}

#[derive(Debug, Clone)]
enum Piece {
    Lit(String),
    Val(TemplateValue),
}

/// Builder over alternating literal fragments and interpolated values.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal fragment text. Whitespace separates tokens.
    pub fn lit(mut self, fragment: impl Into<String>) -> Self {
        self.pieces.push(Piece::Lit(fragment.into()));
        self
    }

    /// Append an interpolated value.
    pub fn val(mut self, value: impl Into<TemplateValue>) -> Self {
        self.pieces.push(Piece::Val(value.into()));
        self
    }

    /// Append a list value (expands to N tokens).
    pub fn list<I, S>(self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.val(TemplateValue::List(
            items.into_iter().map(Into::into).collect(),
        ))
    }

    /// Append a flag map value.
    pub fn flags(self, flags: BTreeMap<String, FlagValue>) -> Self {
        self.val(TemplateValue::Flags(flags))
    }

    /// Append caller-trusted raw text. No quoting is applied.
    pub fn raw(self, text: impl Into<String>) -> Self {
        self.val(TemplateValue::Raw(text.into()))
    }

    /// Lower the template to a [`Command`].
    pub fn build(self) -> Result<Command> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut current = Token::empty();
        let mut pipe_source: Option<Box<Command>> = None;

        let flush = |tokens: &mut Vec<Token>, current: &mut Token| {
            if !current.is_empty() {
                tokens.push(std::mem::replace(current, Token::empty()));
            }
        };

        for piece in self.pieces {
            match piece {
                Piece::Lit(fragment) => {
                    let mut run = String::new();
                    for c in fragment.chars() {
                        if c.is_whitespace() {
                            if !run.is_empty() {
                                current.push_lit(&run);
                                run.clear();
                            }
                            flush(&mut tokens, &mut current);
                        } else {
                            run.push(c);
                        }
                    }
                    if !run.is_empty() {
                        current.push_lit(&run);
                    }
                }
                Piece::Val(value) => match value {
                    TemplateValue::Str(s) => current.push_val(&s),
                    TemplateValue::Raw(s) => current.push_lit(&s),
                    TemplateValue::Bytes(_) => {
                        return Err(Error::InvalidArgument(
                            "byte buffer in command position; pass it via stdin".to_string(),
                        ));
                    }
                    TemplateValue::Missing => {
                        return Err(Error::InvalidArgument(
                            "interpolated an absent value".to_string(),
                        ));
                    }
                    TemplateValue::List(items) => {
                        if !current.is_empty() {
                            return Err(Error::InvalidArgument(
                                "list value must stand alone as its own token".to_string(),
                            ));
                        }
                        for item in items {
                            tokens.push(Token::value(item));
                        }
                    }
                    TemplateValue::Flags(flags) => {
                        if !current.is_empty() {
                            return Err(Error::InvalidArgument(
                                "flag map must stand alone as its own token".to_string(),
                            ));
                        }
                        for (key, flag) in flags {
                            match flag {
                                FlagValue::Switch(true) => {
                                    tokens.push(Token::literal(format!("--{}", key)));
                                }
                                FlagValue::Switch(false) | FlagValue::Absent => {}
                                FlagValue::Value(value) => {
                                    tokens.push(Token::literal(format!("--{}", key)));
                                    tokens.push(Token::value(value));
                                }
                            }
                        }
                    }
                    TemplateValue::Command(cmd) => {
                        if pipe_source.is_some() {
                            return Err(Error::InvalidArgument(
                                "a template may capture at most one nested command".to_string(),
                            ));
                        }
                        pipe_source = Some(cmd);
                    }
                },
            }
        }

        flush(&mut tokens, &mut current);

        if tokens.is_empty() {
            return Err(Error::InvalidArgument("empty command template".to_string()));
        }

        let mut command = Command::from_tokens(tokens);
        command.pipe_from = pipe_source;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PosixQuoter;

    #[test]
    fn test_simple_interpolation() {
        let cmd = Template::new()
            .lit("echo ")
            .val("hello world")
            .build()
            .unwrap();
        assert_eq!(cmd.display_line(), "echo 'hello world'");
        assert_eq!(cmd.argv_raw(), vec!["echo", "hello world"]);
    }

    #[test]
    fn test_injection_is_single_token() {
        let hostile = "'; rm -rf /";
        let cmd = Template::new().lit("echo ").val(hostile).build().unwrap();

        // The rendered line parses back to exactly two words, the second
        // byte-identical to the input.
        let words = shell_words::split(&cmd.display_line()).unwrap();
        assert_eq!(words, vec!["echo".to_string(), hostile.to_string()]);
    }

    #[test]
    fn test_adjacent_value_concatenates() {
        let cmd = Template::new()
            .lit("tar -C ")
            .val("/srv/my dir")
            .lit(" -xf archive.tar")
            .build()
            .unwrap();
        assert_eq!(cmd.display_line(), "tar -C '/srv/my dir' -xf archive.tar");
    }

    #[test]
    fn test_value_glued_to_literal() {
        let cmd = Template::new()
            .lit("grep --include=")
            .val("*.rs")
            .lit(" todo")
            .build()
            .unwrap();
        let rendered = cmd.render_line(&PosixQuoter);
        assert_eq!(rendered, "grep --include='*.rs' todo");
        assert_eq!(cmd.argv_raw(), vec!["grep", "--include=*.rs", "todo"]);
    }

    #[test]
    fn test_list_expansion() {
        let cmd = Template::new()
            .lit("rm -- ")
            .list(["a.txt", "b c.txt"])
            .build()
            .unwrap();
        assert_eq!(cmd.display_line(), "rm -- a.txt 'b c.txt'");
    }

    #[test]
    fn test_list_must_stand_alone() {
        let err = Template::new()
            .lit("rm --file=")
            .list(["a"])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_flag_map_expansion() {
        let mut flags = BTreeMap::new();
        flags.insert("output".to_string(), FlagValue::Value("out dir".to_string()));
        flags.insert("verbose".to_string(), FlagValue::Switch(true));
        flags.insert("color".to_string(), FlagValue::Switch(false));
        flags.insert("legacy".to_string(), FlagValue::Absent);

        let cmd = Template::new().lit("build ").flags(flags).build().unwrap();
        assert_eq!(cmd.display_line(), "build --output 'out dir' --verbose");
    }

    #[test]
    fn test_bytes_rejected_in_command_position() {
        let err = Template::new()
            .lit("echo ")
            .val(vec![0_u8, 1, 2])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_value_rejected() {
        let absent: Option<String> = None;
        let err = Template::new()
            .lit("echo ")
            .val(absent)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_raw_is_unquoted() {
        let cmd = Template::new()
            .lit("sh -c ")
            .raw("a | b")
            .build()
            .unwrap();
        // Raw text is spliced verbatim, trusted by the caller.
        assert_eq!(cmd.display_line(), "sh -c a | b");
    }

    #[test]
    fn test_nested_command_becomes_pipe_source() {
        let upstream = Template::new().lit("cat data.txt").build().unwrap();
        let cmd = Template::new()
            .lit("grep x ")
            .val(upstream)
            .build()
            .unwrap();
        let chain = cmd.pipeline_chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].display_line(), "cat data.txt");
        assert_eq!(chain[1].display_line(), "grep x");
    }

    #[test]
    fn test_empty_template_rejected() {
        let err = Template::new().lit("   ").build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}

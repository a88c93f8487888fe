//! Shell quoting
//!
//! Interpolated values become single argv tokens. When a command line is
//! rendered for a shell (local `sh -c`, SSH exec request, `docker exec ... sh
//! -c`), every value token is quoted with POSIX single-quote escaping;
//! adapters targeting a non-POSIX shell can substitute their own [`Quoter`].

/// Per-adapter quoting seam.
pub trait Quoter: Send + Sync {
    /// Quote one token so a shell parses it as a single word.
    fn quote(&self, token: &str) -> String;

    /// Join pre-quoted tokens into a command line.
    fn join(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }
}

/// POSIX single-quote quoter. Embedded single quotes become `'\''`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixQuoter;

/// Characters that never need quoting in a POSIX shell word.
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

impl Quoter for PosixQuoter {
    fn quote(&self, token: &str) -> String {
        if !token.is_empty() && token.chars().all(is_safe_char) {
            return token.to_string();
        }

        let mut out = String::with_capacity(token.len() + 2);
        out.push('\'');
        for c in token.chars() {
            if c == '\'' {
                out.push_str("'\\''");
            } else {
                out.push(c);
            }
        }
        out.push('\'');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_tokens_pass_unquoted() {
        let q = PosixQuoter;
        assert_eq!(q.quote("hello"), "hello");
        assert_eq!(q.quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(q.quote("--flag=value"), "--flag=value");
        assert_eq!(q.quote("a-b_c.d"), "a-b_c.d");
    }

    #[test]
    fn test_spaces_are_quoted() {
        let q = PosixQuoter;
        assert_eq!(q.quote("hello world"), "'hello world'");
    }

    #[test]
    fn test_empty_token() {
        let q = PosixQuoter;
        assert_eq!(q.quote(""), "''");
    }

    #[test]
    fn test_embedded_single_quote() {
        let q = PosixQuoter;
        assert_eq!(q.quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_injection_attempt_is_inert() {
        let q = PosixQuoter;
        let hostile = "'; rm -rf /";
        let quoted = q.quote(hostile);
        assert_eq!(quoted, "''\\''; rm -rf /'");
        // The quoted form round-trips through a POSIX word splitter as one
        // token equal to the original bytes.
        let words = shell_words::split(&quoted).unwrap();
        assert_eq!(words, vec![hostile.to_string()]);
    }

    #[test]
    fn test_metacharacters_quoted() {
        let q = PosixQuoter;
        for hostile in ["$(whoami)", "`id`", "a;b", "a|b", "a&&b", "a>b", "*"] {
            let quoted = q.quote(hostile);
            let words = shell_words::split(&quoted).unwrap();
            assert_eq!(words, vec![hostile.to_string()], "token: {}", hostile);
        }
    }

    #[test]
    fn test_join() {
        let q = PosixQuoter;
        let tokens = vec!["echo".to_string(), "'hello world'".to_string()];
        assert_eq!(q.join(&tokens), "echo 'hello world'");
    }
}

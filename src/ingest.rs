/// Line-oriented file ingestion with an explicit three-state callback
/// result, used by configuration loading to walk config files line by
/// line.
use crate::types::{Result, RootboxError};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// What the callback wants done after seeing a line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineAction {
    /// Keep going.
    Continue,
    /// Stop early; not an error.
    Stop,
    /// Abort the walk with the given reason.
    Fail(String),
}

/// Apply `callback` to every non-empty line of `path`, in order. Returns
/// the number of lines visited, including the one that requested `Stop`.
pub fn for_each_line<P, F>(path: P, mut callback: F) -> Result<usize>
where
    P: AsRef<Path>,
    F: FnMut(&str) -> LineAction,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        RootboxError::Config(format!("failed to open \"{}\": {}", path.display(), e))
    })?;

    let mut visited = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        visited += 1;
        match callback(&line) {
            LineAction::Continue => {}
            LineAction::Stop => break,
            LineAction::Fail(reason) => return Err(RootboxError::Config(reason)),
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_visits_every_nonempty_line() {
        let file = fixture("a\n\nb\r\nc\n");
        let mut seen = Vec::new();
        let visited = for_each_line(file.path(), |line| {
            seen.push(line.to_string());
            LineAction::Continue
        })
        .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_is_not_an_error() {
        let file = fixture("a\nb\nc\n");
        let visited = for_each_line(file.path(), |line| {
            if line == "b" {
                LineAction::Stop
            } else {
                LineAction::Continue
            }
        })
        .unwrap();
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_fail_propagates_the_reason() {
        let file = fixture("a\nbad line\n");
        let err = for_each_line(file.path(), |line| {
            if line.starts_with("bad") {
                LineAction::Fail(format!("unparseable entry: {}", line))
            } else {
                LineAction::Continue
            }
        })
        .unwrap_err();
        match err {
            RootboxError::Config(msg) => assert!(msg.contains("unparseable")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = for_each_line("/nonexistent/config", |_| LineAction::Continue).unwrap_err();
        assert!(matches!(err, RootboxError::Config(_)));
    }
}

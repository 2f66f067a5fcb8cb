//! Handoff chain tests
//!
//! Uses a recording executor in place of execv so the candidate order,
//! the failure markers and the exhaustion path can be observed.

use cf_init::handoff::{ordered, Executor, HandoffError, Sequencer};
use cf_init::{HandoffCandidate, MarkerWriter};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fails every path except `succeed_on`, recording each attempt.
struct RecordingExecutor {
    succeed_on: Option<PathBuf>,
    attempts: Vec<(PathBuf, Vec<OsString>)>,
}

impl RecordingExecutor {
    fn new(succeed_on: Option<&str>) -> Self {
        Self {
            succeed_on: succeed_on.map(PathBuf::from),
            attempts: Vec::new(),
        }
    }
}

impl Executor for RecordingExecutor {
    type Replaced = PathBuf;

    fn exec(&mut self, path: &Path, argv: &[OsString]) -> Result<PathBuf, HandoffError> {
        self.attempts.push((path.to_path_buf(), argv.to_vec()));
        if self.succeed_on.as_deref() == Some(path) {
            Ok(path.to_path_buf())
        } else {
            Err(HandoffError::ExecFailed {
                path: path.to_path_buf(),
                errno: nix::Error::ENOENT,
            })
        }
    }
}

/// Create a marker writer backed by a temporary directory
fn create_test_markers() -> (MarkerWriter, PathBuf, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let log = temp_dir.path().join("metadata/cf_init/marker.log");
    (MarkerWriter::new(vec![log.clone()]), log, temp_dir)
}

fn chain() -> Vec<HandoffCandidate> {
    vec![
        HandoffCandidate::new("/A", 30).forward_args(),
        HandoffCandidate::new("/B", 20).forward_args(),
        HandoffCandidate::new("/C", 10).with_argv(&["sh"]),
    ]
}

mod sequencer_tests {
    use super::*;

    #[test]
    fn test_stops_at_first_success() {
        let (markers, log, _temp_dir) = create_test_markers();
        let mut sequencer = Sequencer::new(RecordingExecutor::new(Some("/B")), &markers);

        let replaced = sequencer.handoff(&chain(), &[]).unwrap();
        assert_eq!(replaced, PathBuf::from("/B"));

        let attempted: Vec<&Path> = sequencer
            .executor()
            .attempts
            .iter()
            .map(|(p, _)| p.as_path())
            .collect();
        assert_eq!(attempted, vec![Path::new("/A"), Path::new("/B")]);

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content.matches("execv(/A) failed").count(), 1);
        assert_eq!(content.matches("execv(").count(), 1);
        assert!(content.contains("handing off to /B"));
        assert!(!content.contains("/C"));
    }

    #[test]
    fn test_exhaustion_marks_and_reports() {
        let (markers, log, _temp_dir) = create_test_markers();
        let mut sequencer = Sequencer::new(RecordingExecutor::new(None), &markers);

        let exhausted = sequencer.handoff(&chain(), &[]).unwrap_err();
        assert_eq!(exhausted.attempted, 3);
        assert_eq!(sequencer.executor().attempts.len(), 3);

        let content = std::fs::read_to_string(&log).unwrap();
        let last = content.lines().last().unwrap();
        assert!(last.ends_with("all 3 handoff candidates exhausted"));
    }

    #[test]
    fn test_priority_beats_configuration_order() {
        let (markers, _log, _temp_dir) = create_test_markers();
        let mut candidates = chain();
        candidates.reverse();

        let mut sequencer = Sequencer::new(RecordingExecutor::new(None), &markers);
        let _ = sequencer.handoff(&candidates, &[]);

        let attempted: Vec<&Path> = sequencer
            .executor()
            .attempts
            .iter()
            .map(|(p, _)| p.as_path())
            .collect();
        assert_eq!(
            attempted,
            vec![Path::new("/A"), Path::new("/B"), Path::new("/C")]
        );
        assert_eq!(ordered(&candidates)[0].path, PathBuf::from("/A"));
    }

    #[test]
    fn test_argv_forwarded_verbatim() {
        let (markers, _log, _temp_dir) = create_test_markers();
        let args = vec![
            OsString::from("/init"),
            OsString::from("--second-stage"),
            OsString::from("androidboot.hardware=cutf"),
        ];

        let mut sequencer = Sequencer::new(RecordingExecutor::new(None), &markers);
        let _ = sequencer.handoff(&chain(), &args);

        let attempts = &sequencer.executor().attempts;
        assert_eq!(attempts[0].1, args);
        assert_eq!(attempts[1].1, args);
        assert_eq!(attempts[2].1, vec![OsString::from("sh")]);
    }

    #[test]
    fn test_marker_precedes_each_attempt() {
        let (markers, log, _temp_dir) = create_test_markers();
        let mut sequencer = Sequencer::new(RecordingExecutor::new(Some("/C")), &markers);
        sequencer.handoff(&chain(), &[]).unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        let stages: Vec<&str> = content
            .lines()
            .map(|line| line.split_once(' ').unwrap().1)
            .collect();
        assert_eq!(
            stages,
            vec![
                "handing off to /A",
                "execv(/A) failed: ENOENT: No such file or directory",
                "handing off to /B",
                "execv(/B) failed: ENOENT: No such file or directory",
                "handing off to /C",
            ]
        );
    }
}

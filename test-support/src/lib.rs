//! Step-recording reports for tlsplice tests.
//!
//! A [`TestReport`] collects the setup, actions and assertions a test performs.
//! When `TEST_REPORT_DIR` is set, each report is written to
//! `<dir>/<module path>.txt` when it is dropped, including whether the test
//! passed, failed (panicked) or was skipped.

use std::fmt::{self, Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a [`TestReport`] named after the enclosing test function.
///
/// Works in both sync and async tests.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::TestReport::new(name, $title, file!(), line!())
    }};
}

const MAX_DISPLAY: usize = 1000;

enum Step {
    Setup(String),
    Action(String),
    Pass(String),
    Fail(String),
    Output { label: String, text: String },
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Setup(msg) => write!(f, "STEP setup: {}", msg),
            Step::Action(msg) => write!(f, "STEP action: {}", msg),
            Step::Pass(msg) => write!(f, "STEP assert_pass: {}", msg),
            Step::Fail(msg) => write!(f, "STEP assert_fail: {}", msg),
            Step::Output { label, text } => write!(f, "STEP output {}: {:?}", label, text),
        }
    }
}

pub struct TestReport {
    full_path: String,
    title: String,
    source: String,
    steps: Mutex<Vec<Step>>,
    skipped: Mutex<Option<String>>,
    report_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            source: format!("{}:{}", source_file, source_line),
            steps: Mutex::new(Vec::new()),
            skipped: Mutex::new(None),
            report_dir: std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        self.steps.lock().unwrap().push(step);
    }

    fn verdict(&self, pass: bool, msg: String) {
        self.push(if pass { Step::Pass(msg) } else { Step::Fail(msg) });
    }

    fn display<T: Debug + ?Sized>(value: &T) -> String {
        let s = format!("{:?}", value);
        if s.len() <= MAX_DISPLAY {
            format!("`{}`", s)
        } else {
            let mut end = MAX_DISPLAY;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("`{}…` ({} bytes)", &s[..end], s.len())
        }
    }

    /// Mark the test as skipped. Call before returning early.
    pub fn skip(&self, reason: impl Display) {
        *self.skipped.lock().unwrap() = Some(reason.to_string());
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action(msg.to_string()));
    }

    pub fn output(&self, label: &str, text: &str) {
        self.push(Step::Output {
            label: label.to_string(),
            text: text.to_string(),
        });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        self.verdict(
            pass,
            format!(
                "{}: {} == {}",
                label,
                Self::display(actual),
                Self::display(expected)
            ),
        );
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.verdict(
            pass,
            format!(
                "{}: {} contains {}",
                label,
                Self::display(haystack),
                Self::display(needle)
            ),
        );
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.verdict(value, format!("{}: `{}`", label, value));
        assert!(value, "{}", label);
    }

    fn group(&self) -> &str {
        let mut parts = self.full_path.rsplit("::");
        parts.next();
        parts.next().unwrap_or(&self.full_path)
    }

    fn name(&self) -> &str {
        self.full_path.rsplit("::").next().unwrap_or(&self.full_path)
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = match self.skipped.lock().unwrap().as_ref() {
            Some(reason) => format!("skip: {}", reason),
            None if std::thread::panicking() => "fail".to_string(),
            None => "pass".to_string(),
        };

        let mut lines = vec![
            format!("GROUP: {}", self.group()),
            format!("NAME: {}", self.name()),
            format!("TITLE: {}", self.title),
            format!("SOURCE: {}", self.source),
        ];
        lines.extend(self.steps.lock().unwrap().iter().map(|s| s.to_string()));
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let path = dir.join(format!("{}.txt", self.full_path.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}

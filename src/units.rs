//! Test units: which classes, and which of their methods, to run remotely.
//!
//! Units come from an explicit class list or from scanning the compiled test
//! classes directories for include patterns. A surefire-style filter
//! (`FooTest#testA+testB,Bar*#it*`) narrows them further.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

/// Result type for unit resolution.
pub type UnitsResult<T> = Result<T, UnitsError>;

#[derive(Debug, thiserror::Error)]
pub enum UnitsError {
    /// A filter entry could not be parsed.
    #[error("Invalid test filter '{0}'")]
    InvalidFilter(String),

    /// An include pattern is not a valid glob.
    #[error("Invalid include pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A classpath directory could not be walked.
    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Default include patterns used when scanning for test classes.
pub const DEFAULT_INCLUDES: &[&str] = &["**/Test*.class", "**/*Test.class", "**/*TestCase.class"];

/// A test class, optionally narrowed to some of its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    pub class_name: String,
    /// Method name patterns; empty means every method.
    pub methods: Vec<String>,
}

impl TestUnit {
    pub fn class(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            methods: Vec::new(),
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(methods.into_iter().map(Into::into));
        self
    }

    /// The identifiers sent to the remote runner in a `run` command.
    ///
    /// One entry per method pattern, `Class#pattern`, or just the class.
    pub fn to_patterns(&self) -> Vec<String> {
        if self.methods.is_empty() {
            vec![self.class_name.clone()]
        } else {
            self.methods
                .iter()
                .map(|m| format!("{}#{}", self.class_name, m))
                .collect()
        }
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.methods.is_empty() {
            f.write_str(&self.class_name)
        } else {
            write!(f, "{}#{}", self.class_name, self.methods.join("+"))
        }
    }
}

/// One comma-separated entry of a test filter.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterEntry {
    class: Pattern,
    qualified: bool,
    methods: Vec<String>,
}

impl FilterEntry {
    /// Fully qualified patterns match the whole name, simple ones match the last segment.
    fn matches_class(&self, class_name: &str) -> bool {
        if self.qualified {
            self.class.matches(class_name)
        } else {
            let simple = class_name.rsplit('.').next().unwrap_or(class_name);
            self.class.matches(simple)
        }
    }
}

/// A parsed surefire-style test request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestFilter {
    entries: Vec<FilterEntry>,
}

impl TestFilter {
    /// Parses `Class#m1+m2,Other#t*`.
    pub fn parse(s: &str) -> UnitsResult<Self> {
        let mut entries = Vec::new();
        for raw in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (class, methods) = match raw.split_once('#') {
                Some((class, methods)) => {
                    let methods: Vec<String> = methods
                        .split('+')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    if methods.is_empty() {
                        return Err(UnitsError::InvalidFilter(raw.to_string()));
                    }
                    (class, methods)
                }
                None => (raw, Vec::new()),
            };
            let class = class.trim().trim_end_matches(".class").replace('/', ".");
            if class.is_empty() {
                return Err(UnitsError::InvalidFilter(raw.to_string()));
            }
            let pattern =
                Pattern::new(&class).map_err(|_| UnitsError::InvalidFilter(raw.to_string()))?;
            entries.push(FilterEntry {
                class: pattern,
                qualified: class.contains('.'),
                methods,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Narrows `units` to the ones this filter selects.
    ///
    /// An empty filter keeps everything. A class matched by an entry without
    /// methods runs whole; otherwise the method patterns of all matching
    /// entries are merged.
    pub fn apply(&self, units: Vec<TestUnit>) -> Vec<TestUnit> {
        if self.entries.is_empty() {
            return units;
        }
        units
            .into_iter()
            .filter_map(|unit| {
                let matching: Vec<&FilterEntry> = self
                    .entries
                    .iter()
                    .filter(|e| e.matches_class(&unit.class_name))
                    .collect();
                if matching.is_empty() {
                    return None;
                }
                if matching.iter().any(|e| e.methods.is_empty()) {
                    return Some(unit);
                }
                let mut methods: Vec<String> = Vec::new();
                for entry in matching {
                    for m in &entry.methods {
                        if !methods.contains(m) {
                            methods.push(m.clone());
                        }
                    }
                }
                Some(TestUnit {
                    class_name: unit.class_name,
                    methods,
                })
            })
            .collect()
    }
}

/// Ant-style matching: `*` stays within one directory, `**/` spans any number of them.
const INCLUDE_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Finds test classes under compiled classes directories.
///
/// Nested classes (`Outer$Inner`) are skipped. Missing directories are
/// ignored. The result is sorted and free of duplicates.
pub fn scan_classpath(dirs: &[PathBuf], includes: &[String]) -> UnitsResult<Vec<String>> {
    let patterns = includes
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| UnitsError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect::<UnitsResult<Vec<_>>>()?;

    let mut classes = Vec::new();
    for dir in dirs.iter().filter(|d| d.is_dir()) {
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|source| UnitsError::Scan {
                path: dir.clone(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_slash_path(dir, entry.path()) else {
                continue;
            };
            let Some(stem) = relative.strip_suffix(".class") else {
                continue;
            };
            if stem.contains('$') {
                continue;
            }
            if patterns
                .iter()
                .any(|p| p.matches_with(&relative, INCLUDE_OPTIONS))
            {
                classes.push(stem.replace('/', "."));
            }
        }
    }
    classes.sort();
    classes.dedup();
    Ok(classes)
}

fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Where units come from.
#[derive(Debug, Clone, Default)]
pub struct UnitSource {
    /// Explicit class names; when non-empty, no scanning happens.
    pub tests: Vec<String>,
    pub classes_dirs: Vec<PathBuf>,
    /// Include patterns; empty means [`DEFAULT_INCLUDES`].
    pub includes: Vec<String>,
    pub filter: Option<String>,
}

impl UnitSource {
    /// Produces the ordered list of units for one run.
    pub fn resolve(&self) -> UnitsResult<Vec<TestUnit>> {
        let class_names = if self.tests.is_empty() {
            let includes: Vec<String> = if self.includes.is_empty() {
                DEFAULT_INCLUDES.iter().map(|s| s.to_string()).collect()
            } else {
                self.includes.clone()
            };
            scan_classpath(&self.classes_dirs, &includes)?
        } else {
            self.tests.clone()
        };

        let mut units = Vec::new();
        for name in class_names {
            // Explicit entries may already carry methods.
            let unit = match name.split_once('#') {
                Some((class, methods)) => TestUnit::class(class).with_methods(
                    methods.split('+').filter(|m| !m.is_empty()),
                ),
                None => TestUnit::class(name),
            };
            units.push(unit);
        }

        match &self.filter {
            Some(filter) => Ok(TestFilter::parse(filter)?.apply(units)),
            None => Ok(units),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn class_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("com/a")).unwrap();
        fs::write(dir.path().join("com/FooTest.class"), b"").unwrap();
        fs::write(dir.path().join("com/a/BarTest.class"), b"").unwrap();
        dir
    }

    fn scan(dir: &tempfile::TempDir, include: &str) -> Vec<String> {
        scan_classpath(&[dir.path().to_path_buf()], &[include.to_string()]).unwrap()
    }

    #[test]
    fn test_double_star_matches_zero_or_more_directories() {
        let dir = class_tree();
        assert_eq!(scan(&dir, "com/**/*Test.class"), vec!["com.FooTest", "com.a.BarTest"]);
        assert_eq!(scan(&dir, "**/*Test.class"), vec!["com.FooTest", "com.a.BarTest"]);
    }

    #[test]
    fn test_single_star_stays_in_one_directory() {
        let dir = class_tree();
        assert_eq!(scan(&dir, "com/*Test.class"), vec!["com.FooTest"]);
        assert_eq!(scan(&dir, "com/a/B?rTest.class"), vec!["com.a.BarTest"]);
    }

    #[test]
    fn test_invalid_include_pattern() {
        let err = scan_classpath(&[], &["com/***/x".to_string()]).unwrap_err();
        assert!(matches!(err, UnitsError::InvalidPattern { .. }));
    }

    #[test]
    fn test_unit_patterns() {
        let whole = TestUnit::class("com.example.FooTest");
        assert_eq!(whole.to_patterns(), vec!["com.example.FooTest"]);

        let narrowed = TestUnit::class("com.example.FooTest").with_methods(["testA", "it*"]);
        assert_eq!(
            narrowed.to_patterns(),
            vec!["com.example.FooTest#testA", "com.example.FooTest#it*"]
        );
        assert_eq!(narrowed.to_string(), "com.example.FooTest#testA+it*");
    }

    #[test]
    fn test_filter_parse_and_apply() {
        let filter = TestFilter::parse("FooTest#testA+testB, com.example.B?r*").unwrap();
        let units = vec![
            TestUnit::class("com.example.FooTest"),
            TestUnit::class("com.example.BarTest"),
            TestUnit::class("com.other.BazTest"),
        ];
        let selected = filter.apply(units);
        assert_eq!(
            selected,
            vec![
                TestUnit::class("com.example.FooTest").with_methods(["testA", "testB"]),
                TestUnit::class("com.example.BarTest"),
            ]
        );
    }

    #[test]
    fn test_filter_whole_class_wins_over_methods() {
        let filter = TestFilter::parse("FooTest#testA,FooTest").unwrap();
        let selected = filter.apply(vec![TestUnit::class("a.FooTest")]);
        assert_eq!(selected, vec![TestUnit::class("a.FooTest")]);
    }

    #[test]
    fn test_filter_rejects_empty_methods() {
        assert!(matches!(
            TestFilter::parse("FooTest#"),
            Err(UnitsError::InvalidFilter(_))
        ));
        assert!(TestFilter::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_scan_classpath() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("com/example");
        fs::create_dir_all(&pkg).unwrap();
        for name in ["FooTest.class", "FooTest$1.class", "Helper.class", "TestBar.class"] {
            fs::write(pkg.join(name), b"").unwrap();
        }
        fs::write(dir.path().join("RootTest.class"), b"").unwrap();

        let includes: Vec<String> = DEFAULT_INCLUDES.iter().map(|s| s.to_string()).collect();
        let classes = scan_classpath(&[dir.path().to_path_buf()], &includes).unwrap();
        assert_eq!(
            classes,
            vec!["RootTest", "com.example.FooTest", "com.example.TestBar"]
        );
    }

    #[test]
    fn test_resolve_explicit_with_filter() {
        let source = UnitSource {
            tests: vec!["com.example.FooTest".to_string(), "com.example.BarTest#one".to_string()],
            filter: Some("Bar*".to_string()),
            ..UnitSource::default()
        };
        let units = source.resolve().unwrap();
        assert_eq!(units, vec![TestUnit::class("com.example.BarTest").with_methods(["one"])]);
    }
}

use crate::wildcard::{glob_paths, Wildcard};
use qc_core::ProcedureResult;
use serde_json::Value;
use std::fmt;
use std::ops::BitOr;
use std::path::Path;

/// Live session state handed to validators right before they are used.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub store_dir: &'a Path,
    pub results: &'a [ProcedureResult],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    pub session: Option<SessionView<'a>>,
}

impl<'a> ValidationContext<'a> {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn with_session(store_dir: &'a Path, results: &'a [ProcedureResult]) -> Self {
        Self {
            session: Some(SessionView { store_dir, results }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("range bounds must satisfy lo < hi (got {0}, {1})")]
    Inverted(f64, f64),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("argument [{argument}]: Input value [{value}] failed annotated requirement [{requirement}]")]
pub struct ValidationError {
    pub argument: String,
    pub value: String,
    pub requirement: String,
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    lo: f64,
    hi: f64,
}

impl Range {
    pub fn new(lo: f64, hi: f64) -> Result<Self, RangeError> {
        if lo.is_nan() || hi.is_nan() || lo >= hi {
            return Err(RangeError::Inverted(lo, hi));
        }
        Ok(Self { lo, hi })
    }

    pub fn lo(&self) -> f64 {
        self.lo
    }

    pub fn hi(&self) -> f64 {
        self.hi
    }

    pub fn contains(&self, v: f64) -> bool {
        self.lo <= v && v <= self.hi
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        value.as_f64().map(|v| self.contains(v)).unwrap_or(false)
    }
}

fn fmt_bound(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Range({}, {})", fmt_bound(self.lo), fmt_bound(self.hi))
    }
}

/// Where an enumerated-choice link gets its candidate list from.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceSource {
    Fixed(Vec<String>),
    /// Filesystem glob, expanded at validation time.
    Glob(String),
    /// Artifacts recorded by earlier runs of `procedure` whose stored path
    /// matches `pattern`.
    ProcedureFiles { procedure: String, pattern: String },
}

impl ChoiceSource {
    pub fn candidates(&self, ctx: &ValidationContext<'_>) -> Vec<String> {
        match self {
            Self::Fixed(values) => values.clone(),
            Self::Glob(pattern) => glob_paths(pattern),
            Self::ProcedureFiles { procedure, pattern } => {
                let Some(session) = ctx.session else {
                    return Vec::new();
                };
                let Ok(matcher) = Wildcard::new(pattern, true) else {
                    tracing::warn!(pattern = %pattern, "unusable filename pattern");
                    return Vec::new();
                };
                session
                    .results
                    .iter()
                    .filter(|r| r.name == *procedure)
                    .flat_map(|r| r.data_files.iter())
                    .filter(|d| matcher.is_match(&d.path))
                    .map(|d| session.store_dir.join(&d.path).to_string_lossy().to_string())
                    .collect()
            }
        }
    }
}

impl fmt::Display for ChoiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(values) => write!(f, "StrChoices([{}])", values.join(", ")),
            Self::Glob(pattern) => write!(f, "GlobChoices({})", pattern),
            Self::ProcedureFiles { procedure, pattern } => {
                write!(f, "ProcedureDataFiles({}, {})", procedure, pattern)
            }
        }
    }
}

/// Any-of composite over enumerated-choice sources. `a | b` appends `b`'s
/// links after `a`'s.
#[derive(Debug, Clone, PartialEq)]
pub struct Choices {
    links: Vec<ChoiceSource>,
}

impl Choices {
    pub fn fixed<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from(ChoiceSource::Fixed(values.into_iter().map(Into::into).collect()))
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        Self::from(ChoiceSource::Glob(pattern.into()))
    }

    pub fn procedure_files(procedure: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::from(ChoiceSource::ProcedureFiles {
            procedure: procedure.into(),
            pattern: pattern.into(),
        })
    }

    pub fn links(&self) -> &[ChoiceSource] {
        &self.links
    }

    pub fn candidates(&self, ctx: &ValidationContext<'_>) -> Vec<String> {
        self.links.iter().flat_map(|l| l.candidates(ctx)).collect()
    }

    pub fn is_valid(&self, value: &Value, ctx: &ValidationContext<'_>) -> bool {
        let Some(text) = value.as_str() else {
            return false;
        };
        self.links
            .iter()
            .any(|l| l.candidates(ctx).iter().any(|c| c == text))
    }
}

impl From<ChoiceSource> for Choices {
    fn from(source: ChoiceSource) -> Self {
        Self {
            links: vec![source],
        }
    }
}

impl BitOr for Choices {
    type Output = Choices;

    fn bitor(mut self, rhs: Choices) -> Choices {
        self.links.extend(rhs.links);
        self
    }
}

impl fmt::Display for Choices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.links.iter().map(|l| l.to_string()).collect();
        write!(f, "{}", parts.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    Range(Range),
    Choices(Choices),
}

impl Validator {
    /// Probing mode, for live input feedback.
    pub fn is_valid(&self, value: &Value, ctx: &ValidationContext<'_>) -> bool {
        match self {
            Self::Range(range) => range.is_valid(value),
            Self::Choices(choices) => choices.is_valid(value, ctx),
        }
    }

    /// Enforcing mode.
    pub fn ensure(
        &self,
        argument: &str,
        value: &Value,
        ctx: &ValidationContext<'_>,
    ) -> Result<(), ValidationError> {
        if self.is_valid(value, ctx) {
            return Ok(());
        }
        Err(ValidationError {
            argument: argument.to_string(),
            value: display_value(value),
            requirement: self.to_string(),
        })
    }

    /// Enumerable candidates; empty for numeric ranges.
    pub fn candidates(&self, ctx: &ValidationContext<'_>) -> Vec<String> {
        match self {
            Self::Range(_) => Vec::new(),
            Self::Choices(choices) => choices.candidates(ctx),
        }
    }
}

impl From<Range> for Validator {
    fn from(range: Range) -> Self {
        Self::Range(range)
    }
}

impl From<Choices> for Validator {
    fn from(choices: Choices) -> Self {
        Self::Choices(choices)
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(range) => fmt::Display::fmt(range, f),
            Self::Choices(choices) => fmt::Display::fmt(choices, f),
        }
    }
}

pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_core::DataEntry;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn range_accepts_exactly_the_closed_interval() {
        let range = Range::new(-10.0, 0.0).expect("valid bounds");
        let ctx = ValidationContext::detached();
        let validator = Validator::from(range);
        for step in -30..=20 {
            let v = step as f64 * 0.5;
            assert_eq!(
                validator.is_valid(&json!(v), &ctx),
                (-10.0..=0.0).contains(&v),
                "value {}",
                v
            );
        }
        assert!(validator.is_valid(&json!(-10), &ctx));
        assert!(validator.is_valid(&json!(0), &ctx));
        assert!(!validator.is_valid(&json!("-5"), &ctx), "strings are not numbers");
    }

    #[test]
    fn range_rejects_inverted_or_empty_bounds() {
        assert_eq!(Range::new(5.0, 5.0), Err(RangeError::Inverted(5.0, 5.0)));
        assert!(Range::new(2.0, 1.0).is_err());
        assert!(Range::new(f64::NAN, 1.0).is_err());
        assert_eq!(Range::new(0.1, 2.0).expect("ok").to_string(), "Range(0.1, 2)");
    }

    #[test]
    fn or_chain_accepts_if_any_link_accepts() {
        let a = Choices::fixed(["x", "y"]);
        let b = Choices::fixed(["z"]);
        let chain = a.clone() | b.clone();
        let ctx = ValidationContext::detached();
        for probe in ["x", "y", "z", "w", ""] {
            let v = json!(probe);
            assert_eq!(
                chain.is_valid(&v, &ctx),
                a.is_valid(&v, &ctx) || b.is_valid(&v, &ctx),
                "probe {}",
                probe
            );
        }
        assert!(!chain.is_valid(&json!(1), &ctx));
        let mut expected = a.candidates(&ctx);
        expected.extend(b.candidates(&ctx));
        assert_eq!(chain.candidates(&ctx), expected);
        assert_eq!(chain.to_string(), "StrChoices([x, y]) | StrChoices([z])");
    }

    #[test]
    fn procedure_files_scan_prior_results() {
        let mut first = ProcedureResult::new("dummy_procedure", BTreeMap::new());
        first.push_data(DataEntry::new("dummy_procedure_a/initial.json", "Initial readout"));
        first.push_data(DataEntry::new("dummy_procedure_a/notes.txt", "notes"));
        let mut other = ProcedureResult::new("daq_acquire", BTreeMap::new());
        other.push_data(DataEntry::new("daq_acquire_a/run.json", "data"));
        let results = vec![first, other];
        let store = Path::new("/store/TB3.0001");
        let ctx = ValidationContext::with_session(store, &results);

        let validator = Validator::from(Choices::procedure_files("dummy_procedure", "*.json"));
        let expected = "/store/TB3.0001/dummy_procedure_a/initial.json";
        assert_eq!(validator.candidates(&ctx), vec![expected.to_string()]);
        assert!(validator.is_valid(&json!(expected), &ctx));
        assert!(!validator.is_valid(&json!("/store/TB3.0001/daq_acquire_a/run.json"), &ctx));
        assert!(
            validator.candidates(&ValidationContext::detached()).is_empty(),
            "no session attached"
        );
    }

    #[test]
    fn enforcing_mode_names_value_and_validator() {
        let validator = Validator::from(Range::new(5.0, 10.0).expect("bounds"));
        let err = validator
            .ensure("outer_size", &json!(11), &ValidationContext::detached())
            .expect_err("out of range");
        assert_eq!(
            err.to_string(),
            "argument [outer_size]: Input value [11] failed annotated requirement [Range(5, 10)]"
        );
        let choices = Validator::from(Choices::glob("/nonexistent/*.yaml"));
        let err = choices
            .ensure("config", &json!("a.yaml"), &ValidationContext::detached())
            .expect_err("no match");
        assert_eq!(err.value, "a.yaml");
        assert_eq!(err.requirement, "GlobChoices(/nonexistent/*.yaml)");
    }
}

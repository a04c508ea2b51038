//! Validation rules and multi-parameter constraints.
//!
//! A [`Rule`] checks one parameter value; a [`Constraint`] checks a relation between
//! several parameters of the same command. Both report a [`Match`] carrying an optional
//! human-readable detail, and describe themselves through `Display` so that failure
//! messages can cite the rule that was broken.
//!
//! Every registered parameter gets a rule. When none is given, [`default_rule`] picks
//! one from the parameter type: finite numbers for scalars, finite elements for numeric
//! lists, and no restriction otherwise.

use crate::parameter::{ParameterSet, ParameterType, ParameterValue};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Match
// =============================================================================

/// Outcome of a rule or constraint check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Match {
    /// Whether the check passed
    pub ok: bool,
    /// Optional explanation (mostly useful on failure)
    pub details: String,
}

impl Match {
    /// Passing check without details.
    pub fn pass() -> Self {
        Self {
            ok: true,
            details: String::new(),
        }
    }

    /// Failing check with an explanation.
    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            ok: false,
            details: details.into(),
        }
    }

    fn from_bool(ok: bool) -> Self {
        Self {
            ok,
            details: String::new(),
        }
    }
}

// =============================================================================
// Rule
// =============================================================================

/// Single-parameter validation rule.
pub trait Rule: fmt::Display + Send + Sync {
    /// Whether this rule can check values of the given type.
    fn accepts(&self, ty: ParameterType) -> bool;

    /// Check a value. Only called with values of an accepted type.
    fn verify(&self, value: &ParameterValue) -> Match;
}

/// Rule used for a parameter registered without an explicit one.
pub fn default_rule(ty: ParameterType) -> Arc<dyn Rule> {
    match ty {
        ParameterType::Int | ParameterType::Float => Arc::new(FiniteNumber),
        ParameterType::IntList | ParameterType::FloatList => Arc::new(FiniteVector),
        ParameterType::Bool | ParameterType::String | ParameterType::StringList => {
            Arc::new(NoRule)
        }
    }
}

/// Accepts any value of any type.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRule;

impl fmt::Display for NoRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("none")
    }
}

impl Rule for NoRule {
    fn accepts(&self, _ty: ParameterType) -> bool {
        true
    }

    fn verify(&self, _value: &ParameterValue) -> Match {
        Match::pass()
    }
}

/// Scalar number that is neither NaN nor infinite.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiniteNumber;

impl fmt::Display for FiniteNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("isFinite(x)")
    }
}

impl Rule for FiniteNumber {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(value.as_f64().is_some_and(f64::is_finite))
    }
}

/// Numeric list whose elements are all finite.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiniteVector;

impl fmt::Display for FiniteVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("all(x, isFinite)")
    }
}

impl Rule for FiniteVector {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number_list()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        let Some(items) = value.as_f64_list() else {
            return Match::fail("not a numeric list");
        };
        let bad: Vec<String> = items
            .iter()
            .enumerate()
            .filter(|(_, x)| !x.is_finite())
            .map(|(i, _)| i.to_string())
            .collect();
        if bad.is_empty() {
            Match::pass()
        } else {
            Match::fail(format!("non-finite elements at indices [{}]", bad.join(", ")))
        }
    }
}

/// String that is not empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyString;

impl fmt::Display for NonEmptyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("!x.empty()")
    }
}

impl Rule for NonEmptyString {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty == ParameterType::String
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(value.as_str().is_some_and(|s| !s.is_empty()))
    }
}

/// Number within the closed range `[lower, upper]`.
#[derive(Debug, Clone, Copy)]
pub struct InRange {
    lower: f64,
    upper: f64,
}

impl InRange {
    /// Range rule; bounds are inclusive.
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

impl fmt::Display for InRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x in [{}, {}]", self.lower, self.upper)
    }
}

impl Rule for InRange {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(
            value
                .as_f64()
                .is_some_and(|x| x >= self.lower && x <= self.upper),
        )
    }
}

/// Number outside the closed range `[lower, upper]`.
#[derive(Debug, Clone, Copy)]
pub struct OutOfRange {
    lower: f64,
    upper: f64,
}

impl OutOfRange {
    /// Excluded range; bounds are inclusive.
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

impl fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x not in [{}, {}]", self.lower, self.upper)
    }
}

impl Rule for OutOfRange {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(
            value
                .as_f64()
                .is_some_and(|x| x < self.lower || x > self.upper),
        )
    }
}

/// Number strictly greater than a bound.
#[derive(Debug, Clone, Copy)]
pub struct GreaterThan(pub f64);

impl fmt::Display for GreaterThan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x > {}", self.0)
    }
}

impl Rule for GreaterThan {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(value.as_f64().is_some_and(|x| x > self.0))
    }
}

/// Number strictly lesser than a bound.
#[derive(Debug, Clone, Copy)]
pub struct LesserThan(pub f64);

impl fmt::Display for LesserThan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x < {}", self.0)
    }
}

impl Rule for LesserThan {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_number()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(value.as_f64().is_some_and(|x| x < self.0))
    }
}

/// String taken from a fixed set of choices.
#[derive(Debug, Clone)]
pub struct IsAmong {
    choices: Vec<String>,
}

impl IsAmong {
    /// Rule accepting exactly the listed strings.
    pub fn new<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for IsAmong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x in {{{}}}", self.choices.join(", "))
    }
}

impl Rule for IsAmong {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty == ParameterType::String
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(
            value
                .as_str()
                .is_some_and(|s| self.choices.iter().any(|c| c == s)),
        )
    }
}

/// List with an exact number of elements.
#[derive(Debug, Clone, Copy)]
pub struct OfSize(pub usize);

impl fmt::Display for OfSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "len(x) == {}", self.0)
    }
}

impl Rule for OfSize {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty.is_list()
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        match value.len() {
            Some(n) if n == self.0 => Match::pass(),
            Some(n) => Match::fail(format!("size is {}", n)),
            None => Match::fail("not a list"),
        }
    }
}

/// String naming an existing filesystem path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathExists;

impl fmt::Display for PathExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("exists(x)")
    }
}

impl Rule for PathExists {
    fn accepts(&self, ty: ParameterType) -> bool {
        ty == ParameterType::String
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        match value.as_str() {
            Some(path) if Path::new(path).exists() => Match::pass(),
            Some(path) => Match::fail(format!("path '{}' does not exist", path)),
            None => Match::fail("not a string"),
        }
    }
}

/// Negation of another rule.
pub struct Not(Arc<dyn Rule>);

impl Not {
    /// Negates `rule`.
    pub fn new(rule: impl Rule + 'static) -> Self {
        Self(Arc::new(rule))
    }
}

impl fmt::Display for Not {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!({})", self.0)
    }
}

impl Rule for Not {
    fn accepts(&self, ty: ParameterType) -> bool {
        self.0.accepts(ty)
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        Match::from_bool(!self.0.verify(value).ok)
    }
}

/// Passes when either of two rules passes.
pub struct Or(Arc<dyn Rule>, Arc<dyn Rule>);

impl Or {
    /// Disjunction of `left` and `right`.
    pub fn new(left: impl Rule + 'static, right: impl Rule + 'static) -> Self {
        Self(Arc::new(left), Arc::new(right))
    }
}

impl fmt::Display for Or {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} || {})", self.0, self.1)
    }
}

impl Rule for Or {
    fn accepts(&self, ty: ParameterType) -> bool {
        self.0.accepts(ty) && self.1.accepts(ty)
    }

    fn verify(&self, value: &ParameterValue) -> Match {
        let left = self.0.verify(value);
        if left.ok {
            return left;
        }
        let right = self.1.verify(value);
        if right.ok {
            right
        } else {
            Match::fail(
                [left.details, right.details]
                    .into_iter()
                    .filter(|d| !d.is_empty())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }
}

// =============================================================================
// Constraint
// =============================================================================

/// Check spanning several parameters of one command.
pub trait Constraint: fmt::Display + Send + Sync {
    /// Names and types of the parameters this constraint reads.
    fn parameters(&self) -> Vec<(String, ParameterType)>;

    /// Check the given values. The set contains every parameter listed by
    /// [`Constraint::parameters`].
    fn verify(&self, params: &ParameterSet) -> Match;
}

type ConstraintFn = dyn Fn(&ParameterSet) -> Match + Send + Sync;

/// Constraint backed by a closure.
///
/// ```
/// use rust_swatch::parameter::ParameterType;
/// use rust_swatch::rules::{FnConstraint, Match};
///
/// let window = FnConstraint::new(
///     "start < stop",
///     [("start", ParameterType::Int), ("stop", ParameterType::Int)],
///     |p| {
///         let ok = p["start"].as_i64() < p["stop"].as_i64();
///         if ok { Match::pass() } else { Match::fail("empty window") }
///     },
/// );
/// ```
pub struct FnConstraint {
    description: String,
    parameters: Vec<(String, ParameterType)>,
    check: Box<ConstraintFn>,
}

impl FnConstraint {
    /// Constraint with a description, the parameters it reads and its check.
    pub fn new<I, S, F>(description: impl Into<String>, parameters: I, check: F) -> Self
    where
        I: IntoIterator<Item = (S, ParameterType)>,
        S: Into<String>,
        F: Fn(&ParameterSet) -> Match + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            parameters: parameters.into_iter().map(|(n, t)| (n.into(), t)).collect(),
            check: Box::new(check),
        }
    }
}

impl fmt::Display for FnConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl Constraint for FnConstraint {
    fn parameters(&self) -> Vec<(String, ParameterType)> {
        self.parameters.clone()
    }

    fn verify(&self, params: &ParameterSet) -> Match {
        (self.check)(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::parameter_set;

    #[test]
    fn test_default_rules() {
        assert_eq!(default_rule(ParameterType::Int).to_string(), "isFinite(x)");
        assert_eq!(default_rule(ParameterType::FloatList).to_string(), "all(x, isFinite)");
        assert_eq!(default_rule(ParameterType::String).to_string(), "none");

        let finite = FiniteNumber;
        assert!(finite.verify(&ParameterValue::Float(1.0)).ok);
        assert!(!finite.verify(&ParameterValue::Float(f64::NAN)).ok);
        assert!(!finite.verify(&ParameterValue::Float(f64::INFINITY)).ok);

        let vector = FiniteVector;
        let bad = vector.verify(&ParameterValue::FloatList(vec![1.0, f64::NAN, 2.0]));
        assert!(!bad.ok);
        assert_eq!(bad.details, "non-finite elements at indices [1]");
    }

    #[test]
    fn test_range_rules() {
        let in_range = InRange::new(0.0, 10.0);
        assert!(in_range.verify(&ParameterValue::Int(0)).ok);
        assert!(in_range.verify(&ParameterValue::Float(10.0)).ok);
        assert!(!in_range.verify(&ParameterValue::Int(11)).ok);

        let out = OutOfRange::new(0.0, 10.0);
        assert!(out.verify(&ParameterValue::Int(-1)).ok);
        assert!(!out.verify(&ParameterValue::Int(5)).ok);

        assert!(GreaterThan(2.0).verify(&ParameterValue::Int(3)).ok);
        assert!(!GreaterThan(2.0).verify(&ParameterValue::Int(2)).ok);
        assert!(LesserThan(2.0).verify(&ParameterValue::Float(1.5)).ok);
        assert!(!InRange::new(0.0, 1.0).accepts(ParameterType::String));
    }

    #[test]
    fn test_string_and_list_rules() {
        assert!(NonEmptyString.verify(&"x".into()).ok);
        assert!(!NonEmptyString.verify(&"".into()).ok);

        let among = IsAmong::new(["internal", "external"]);
        assert_eq!(among.to_string(), "x in {internal, external}");
        assert!(among.verify(&"external".into()).ok);
        assert!(!among.verify(&"other".into()).ok);

        let size = OfSize(2);
        assert!(size.verify(&ParameterValue::IntList(vec![1, 2])).ok);
        assert_eq!(
            size.verify(&ParameterValue::IntList(vec![1])).details,
            "size is 1"
        );
        assert!(!size.accepts(ParameterType::Int));
    }

    #[test]
    fn test_combinators() {
        let not_zero = Not::new(InRange::new(0.0, 0.0));
        assert_eq!(not_zero.to_string(), "!(x in [0, 0])");
        assert!(not_zero.verify(&ParameterValue::Int(1)).ok);
        assert!(!not_zero.verify(&ParameterValue::Int(0)).ok);

        let either = Or::new(LesserThan(0.0), GreaterThan(10.0));
        assert!(either.verify(&ParameterValue::Int(-3)).ok);
        assert!(either.verify(&ParameterValue::Int(30)).ok);
        assert!(!either.verify(&ParameterValue::Int(3)).ok);
    }

    #[test]
    fn test_path_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        assert!(PathExists.verify(&ParameterValue::String(path)).ok);
        assert!(!PathExists
            .verify(&ParameterValue::from("/definitely/not/here"))
            .ok);
    }

    #[test]
    fn test_fn_constraint() {
        let c = FnConstraint::new(
            "a < b",
            [("a", ParameterType::Int), ("b", ParameterType::Int)],
            |p| Match::from_bool(p["a"].as_i64() < p["b"].as_i64()),
        );
        assert_eq!(c.to_string(), "a < b");
        assert_eq!(c.parameters().len(), 2);
        let ok = parameter_set([("a", ParameterValue::Int(1)), ("b", ParameterValue::Int(2))]);
        let bad = parameter_set([("a", ParameterValue::Int(3)), ("b", ParameterValue::Int(2))]);
        assert!(c.verify(&ok).ok);
        assert!(!c.verify(&bad).ok);
    }
}

//! Response filter chain.
//!
//! Filters run in order over the raw completion text. A filter that fails
//! (returns an error or panics) is skipped: the chain continues with the text
//! as it was before that filter ran.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::warn;

use crate::config::RenderMode;
use crate::markup::{self, MarkupOptions};

/// Per-send information handed to every filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterContext {
    pub render_mode: RenderMode,
    pub model: String,
}

pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, input: &str, context: &FilterContext) -> Result<String>;
}

/// Converts Markdown to Org when the session renders Org; otherwise a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupFilter {
    pub options: MarkupOptions,
}

impl ResponseFilter for MarkupFilter {
    fn name(&self) -> &str {
        "markup"
    }

    fn apply(&self, input: &str, context: &FilterContext) -> Result<String> {
        Ok(match context.render_mode {
            RenderMode::Org => markup::convert_with(input, self.options),
            RenderMode::Plain => input.to_string(),
        })
    }
}

/// Removes trailing whitespace from every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimTrailingWhitespace;

impl ResponseFilter for TrimTrailingWhitespace {
    fn name(&self) -> &str {
        "trim_trailing_whitespace"
    }

    fn apply(&self, input: &str, _context: &FilterContext) -> Result<String> {
        Ok(input
            .split('\n')
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Drops a leading `<think>...</think>` reasoning block.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripThink;

impl ResponseFilter for StripThink {
    fn name(&self) -> &str {
        "strip_think"
    }

    fn apply(&self, input: &str, _context: &FilterContext) -> Result<String> {
        let Some(rest) = input.trim_start().strip_prefix("<think>") else {
            return Ok(input.to_string());
        };
        match rest.find("</think>") {
            Some(end) => Ok(rest[end + "</think>".len()..].trim_start().to_string()),
            None => bail!("unterminated <think> block"),
        }
    }
}

/// Adapter for closures.
pub struct FnFilter<F> {
    name: String,
    f: F,
}

impl<F> ResponseFilter for FnFilter<F>
where
    F: Fn(&str, &FilterContext) -> Result<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: &str, context: &FilterContext) -> Result<String> {
        (self.f)(input, context)
    }
}

/// Ordered list of filters. Cheap to clone.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ResponseFilter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterChain {
    /// Names accepted by [`FilterChain::from_names`].
    pub const BUILTIN: &'static [&'static str] =
        &["markup", "trim_trailing_whitespace", "strip_think"];

    pub fn new() -> Self {
        Self::default()
    }

    /// The default chain: just the markup filter.
    pub fn with_defaults() -> Self {
        let mut chain = Self::new();
        chain.push(MarkupFilter::default());
        chain
    }

    /// Builds a chain from built-in filter names, in order.
    ///
    /// # Errors
    /// Returns an error for an unknown name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut chain = Self::new();
        for name in names {
            match name.as_ref() {
                "markup" => chain.push(MarkupFilter::default()),
                "trim_trailing_whitespace" => chain.push(TrimTrailingWhitespace),
                "strip_think" => chain.push(StripThink),
                other => bail!(
                    "Unknown filter '{other}'. Available: {}",
                    Self::BUILTIN.join(", ")
                ),
            }
        }
        Ok(chain)
    }

    pub fn push(&mut self, filter: impl ResponseFilter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    pub fn push_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&str, &FilterContext) -> Result<String> + Send + Sync + 'static,
    {
        self.push(FnFilter {
            name: name.into(),
            f,
        });
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter in order and returns the final text.
    pub fn apply(&self, raw: &str, context: &FilterContext) -> String {
        let mut current = raw.to_string();
        for filter in &self.filters {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| filter.apply(&current, context)));
            match outcome {
                Ok(Ok(next)) => current = next,
                Ok(Err(err)) => {
                    warn!(filter = filter.name(), error = %err, "Response filter failed; skipping");
                }
                Err(_) => {
                    warn!(filter = filter.name(), "Response filter panicked; skipping");
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> FilterContext {
        FilterContext {
            render_mode: RenderMode::Org,
            model: "test".to_string(),
        }
    }

    fn plain() -> FilterContext {
        FilterContext {
            render_mode: RenderMode::Plain,
            model: "test".to_string(),
        }
    }

    #[test]
    fn default_chain_converts_only_for_org() {
        let chain = FilterChain::with_defaults();
        assert_eq!(chain.apply("`x`", &org()), "=x=");
        assert_eq!(chain.apply("`x`", &plain()), "`x`");
    }

    #[test]
    fn filters_run_in_order() {
        let mut chain = FilterChain::new();
        chain.push_fn("a", |s, _| Ok(format!("{s}a")));
        chain.push_fn("b", |s, _| Ok(format!("{s}b")));
        assert_eq!(chain.apply("", &plain()), "ab");
    }

    #[test]
    fn failing_filter_is_skipped() {
        let mut with_failure = FilterChain::new();
        with_failure.push_fn("upper", |s, _| Ok(s.to_uppercase()));
        with_failure.push_fn("broken", |_, _| bail!("boom"));
        with_failure.push_fn("exclaim", |s, _| Ok(format!("{s}!")));

        let mut without = FilterChain::new();
        without.push_fn("upper", |s, _| Ok(s.to_uppercase()));
        without.push_fn("exclaim", |s, _| Ok(format!("{s}!")));

        for input in ["hi", "", "two words"] {
            assert_eq!(with_failure.apply(input, &plain()), without.apply(input, &plain()));
        }
    }

    #[test]
    fn panicking_filter_is_skipped() {
        let mut chain = FilterChain::new();
        chain.push_fn("panics", |_, _| panic!("filter bug"));
        chain.push_fn("suffix", |s, _| Ok(format!("{s}.")));
        assert_eq!(chain.apply("done", &plain()), "done.");
    }

    #[test]
    fn strip_think_removes_reasoning_prefix() {
        let out = StripThink
            .apply("<think>\nplan\n</think>\n\nAnswer.", &plain())
            .unwrap();
        assert_eq!(out, "Answer.");
        assert!(StripThink.apply("<think>never closed", &plain()).is_err());
        assert_eq!(StripThink.apply("no reasoning", &plain()).unwrap(), "no reasoning");
    }

    #[test]
    fn trim_trailing_whitespace_per_line() {
        let out = TrimTrailingWhitespace.apply("a  \nb\t\n", &plain()).unwrap();
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn from_names_builds_chain() {
        let chain = FilterChain::from_names(&["strip_think", "markup"]).unwrap();
        assert_eq!(chain.names(), vec!["strip_think", "markup"]);
        assert!(FilterChain::from_names(&["nope"]).is_err());
    }
}

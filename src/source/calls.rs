use super::{EventSource, SourceError};
use crate::lifecycle::ProcessRegistry;

static CALLS_REGISTRY: ProcessRegistry = ProcessRegistry::new();

/// The set of wrapped functions a traced-call collector records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedFunctions {
    names: Vec<String>,
}

impl TracedFunctions {
    /// Parses a `:` or `,` separated selection. An absent or empty selection
    /// traces every traceable function. Names that are not traceable are
    /// ignored, so a selection made only of unknown names traces nothing.
    pub fn parse(selection: Option<&str>, traceable: &[&str]) -> Self {
        let names = match selection.map(str::trim) {
            None | Some("") => traceable.iter().map(|name| name.to_string()).collect(),
            Some(selection) => selection
                .split([':', ','])
                .map(str::trim)
                .filter(|name| traceable.contains(name))
                .map(str::to_string)
                .collect(),
        };
        TracedFunctions { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|traced| traced == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Source for wrapped library calls. The wrappers run on the profiled thread
/// and consult [`CallSource::is_traced`] before recording anything.
pub struct CallSource {
    traced: TracedFunctions,
    armed: bool,
}

impl CallSource {
    pub fn new(traced: TracedFunctions) -> Self {
        CallSource {
            traced,
            armed: false,
        }
    }

    pub fn is_traced(&self, function: &str) -> bool {
        self.armed && self.traced.contains(function)
    }

    pub fn traced(&self) -> &TracedFunctions {
        &self.traced
    }
}

impl EventSource for CallSource {
    fn registry(&self) -> &'static ProcessRegistry {
        &CALLS_REGISTRY
    }

    fn attach(&mut self) -> Result<(), SourceError> {
        self.armed = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TRACEABLE: &[&str] = &["read", "write", "open", "close"];

    #[rstest]
    #[case::absent(None, &["read", "write", "open", "close"])]
    #[case::empty(Some(""), &["read", "write", "open", "close"])]
    #[case::colon_separated(Some("read:write"), &["read", "write"])]
    #[case::comma_separated(Some("close,open"), &["close", "open"])]
    #[case::unknown_names_are_ignored(Some("read:fread:wirte"), &["read"])]
    #[case::only_unknown_names(Some("fread"), &[])]
    fn test_traced_functions(#[case] selection: Option<&str>, #[case] expected: &[&str]) {
        let traced = TracedFunctions::parse(selection, TRACEABLE);
        assert_eq!(traced.names(), expected);
    }

    #[test]
    fn test_only_armed_sources_trace() {
        let mut source = CallSource::new(TracedFunctions::parse(Some("read"), TRACEABLE));
        assert!(!source.is_traced("read"));
        source.attach().unwrap();
        assert!(source.is_traced("read"));
        assert!(!source.is_traced("write"));
        source.detach();
        assert!(!source.is_traced("read"));
    }
}

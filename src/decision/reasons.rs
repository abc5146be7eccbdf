use super::DecideOption;

/// Diagnostics collected while resolving a decision.
///
/// Errors are always kept. Informational messages are only kept when the caller asked for them
/// with [`DecideOption::IncludeReasons`], so that the common path does not pay for formatting
/// them into the decision.
#[derive(Debug, Clone, Default)]
pub struct DecisionReasons {
    include_infos: bool,
    errors: Vec<String>,
    infos: Vec<String>,
}

impl DecisionReasons {
    pub fn new(options: &[DecideOption]) -> DecisionReasons {
        DecisionReasons {
            include_infos: options.contains(&DecideOption::IncludeReasons),
            errors: Vec::new(),
            infos: Vec::new(),
        }
    }

    pub fn add_error(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
    }

    /// `reason` is only called when informational reasons are kept.
    pub fn add_info(&mut self, reason: impl FnOnce() -> String) {
        if self.include_infos {
            self.infos.push(reason());
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn infos(&self) -> &[String] {
        &self.infos
    }

    /// Errors first, then informational reasons.
    pub fn into_vec(self) -> Vec<String> {
        let mut reasons = self.errors;
        reasons.extend(self.infos);
        reasons
    }
}

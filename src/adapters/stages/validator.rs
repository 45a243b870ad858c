use std::collections::BTreeMap;

use http::HeaderName;
use regex::Regex;
use serde::Deserialize;

use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageError, StageSlot},
    ports::stage::{Close, Validate},
};

#[derive(Debug, Default, Deserialize)]
struct HeaderRuleParams {
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    regexp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeaderValidatorParams {
    headers: BTreeMap<String, HeaderRuleParams>,
}

/// One required header. With neither `values` nor `regexp`, presence is enough.
struct HeaderRule {
    name: HeaderName,
    values: Vec<String>,
    regexp: Option<Regex>,
}

impl HeaderRule {
    fn accepts(&self, value: &str) -> bool {
        if self.values.is_empty() && self.regexp.is_none() {
            return true;
        }
        self.values.iter().any(|allowed| allowed == value)
            || self.regexp.as_ref().is_some_and(|re| re.is_match(value))
    }
}

/// Rejects requests whose headers do not satisfy every configured rule.
pub struct HeaderValidator {
    rules: Vec<HeaderRule>,
}

impl HeaderValidator {
    pub fn new(spec: &StageSpec) -> Result<Self, BuildError> {
        let slot = StageSlot::Validator;
        let params: HeaderValidatorParams = spec.parse_params(slot)?;
        if params.headers.is_empty() {
            return Err(BuildError::invalid(slot, "at least one header rule is required"));
        }

        let rules = params
            .headers
            .into_iter()
            .map(|(name, rule)| {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| BuildError::invalid(slot, format!("invalid header '{name}': {e}")))?;
                let regexp = rule
                    .regexp
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        BuildError::invalid(slot, format!("invalid regexp for header '{name}': {e}"))
                    })?;
                Ok(HeaderRule {
                    name: header,
                    values: rule.values,
                    regexp,
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        Ok(Self { rules })
    }
}

impl Close for HeaderValidator {}

impl Validate for HeaderValidator {
    fn validate(&self, ctx: &RequestContext) -> Result<(), StageError> {
        let headers = ctx.request().headers();
        for rule in &self.rules {
            let value = headers
                .get(&rule.name)
                .ok_or_else(|| StageError::Invalid(format!("header '{}' is missing", rule.name)))?
                .to_str()
                .map_err(|_| {
                    StageError::Invalid(format!("header '{}' is not valid text", rule.name))
                })?;
            if !rule.accepts(value) {
                return Err(StageError::Invalid(format!(
                    "header '{}' has a disallowed value",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

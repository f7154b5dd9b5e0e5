//! Keyword filtering.
//!
//! Sources can name a filter profile; only posts whose (normalized) text
//! contains at least one of the profile's keywords make it through. Used
//! to follow broad accounts or feeds while echoing only on-topic content.

use std::collections::HashMap;

use tracing::debug;

use crate::config::KeywordsFilterConfig;
use crate::error::ConfigError;
use crate::text::normalize_for_matching;

pub struct KeywordFilter {
    profiles: HashMap<String, Vec<String>>,
}

impl KeywordFilter {
    pub fn new(config: &KeywordsFilterConfig) -> Self {
        let profiles = config
            .profiles
            .iter()
            .map(|(name, profile)| {
                let keywords = profile
                    .keywords
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect();
                (name.clone(), keywords)
            })
            .collect();
        Self { profiles }
    }

    /// True when any keyword of `profile` appears in `text`. The text is
    /// HTML-stripped and case/accent-folded first, so feeds and fediverse
    /// statuses can be matched with the same profiles.
    pub fn profile_allows_text(&self, profile: &str, text: &str) -> Result<bool, ConfigError> {
        let keywords = self.profiles.get(profile).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown keywords filter profile [{profile}]"))
        })?;

        let haystack = normalize_for_matching(text);
        for keyword in keywords {
            if haystack.contains(keyword.as_str()) {
                return Ok(true);
            }
        }

        debug!(profile, "no keyword matched");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeywordProfile;

    fn filter_with(profile: &str, keywords: &[&str]) -> KeywordFilter {
        let mut profiles = HashMap::new();
        profiles.insert(
            profile.to_string(),
            KeywordProfile {
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
            },
        );
        KeywordFilter::new(&KeywordsFilterConfig { profiles })
    }

    #[test]
    fn matching_keyword_allows_text() {
        let filter = filter_with("sports", &["football"]);
        assert!(filter
            .profile_allows_text("sports", "Local FOOTBALL club wins again")
            .unwrap());
    }

    #[test]
    fn non_matching_text_is_rejected() {
        let filter = filter_with("sports", &["football"]);
        assert!(!filter
            .profile_allows_text("sports", "City council meeting minutes")
            .unwrap());
    }

    #[test]
    fn html_and_accents_are_normalized_before_matching() {
        let filter = filter_with("cat", &["futbol"]);
        assert!(filter
            .profile_allows_text("cat", "<p>Resultats del <b>fútbol</b> català</p>")
            .unwrap());
    }

    #[test]
    fn unknown_profile_is_a_config_error() {
        let filter = filter_with("sports", &["football"]);
        assert!(filter.profile_allows_text("missing", "whatever").is_err());
    }
}

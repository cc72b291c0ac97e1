//! Catalog filtering: canonicalization, exclusion rules, and de-duplication.

use std::collections::HashSet;

use regex::Regex;

use crate::core::offer_id::{canonical_url, offer_id};
use crate::core::types::{Offer, RawOffer};

/// Exclusion rules applied to enumerated offers.
///
/// Matching is case-insensitive for suffixes and tags. Patterns are regular
/// expressions matched against the trimmed title.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    title_suffixes: Vec<String>,
    tags: Vec<String>,
    title_patterns: Vec<Regex>,
}

impl ExclusionRules {
    pub fn new(
        title_suffixes: &[String],
        tags: &[String],
        title_patterns: &[String],
    ) -> Result<Self, regex::Error> {
        let title_patterns = title_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            title_suffixes: title_suffixes
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            tags: tags
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            title_patterns,
        })
    }

    /// Reason the offer is excluded, or `None` if it is kept.
    pub fn exclusion_reason(&self, offer: &RawOffer) -> Option<String> {
        let title = offer.title.trim();
        let lower = title.to_lowercase();
        if let Some(suffix) = self.title_suffixes.iter().find(|s| lower.ends_with(s.as_str())) {
            return Some(format!("title suffix '{suffix}'"));
        }
        if let Some(tag) = offer
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .find(|t| self.tags.contains(t))
        {
            return Some(format!("tag '{tag}'"));
        }
        if let Some(pattern) = self.title_patterns.iter().find(|p| p.is_match(title)) {
            return Some(format!("title pattern '{}'", pattern.as_str()));
        }
        None
    }
}

/// Entry dropped while resolving the catalog, kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub title: String,
    pub url: String,
    pub reason: String,
}

/// Resolved catalog: kept offers in catalog order plus rejected entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub offers: Vec<Offer>,
    pub rejected: Vec<Rejected>,
}

/// Canonicalize, filter, and de-duplicate raw offers, preserving order.
///
/// The first occurrence of an id wins; later duplicates are rejected.
pub fn resolve_offers(raw: &[RawOffer], base_url: Option<&str>, rules: &ExclusionRules) -> Resolved {
    let mut resolved = Resolved::default();
    let mut seen = HashSet::new();

    for candidate in raw {
        let reject = |reason: String| Rejected {
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            reason,
        };

        let Some(offer) = to_offer(candidate, base_url) else {
            resolved.rejected.push(reject("no stable id in url".to_string()));
            continue;
        };
        if offer.title.is_empty() {
            resolved.rejected.push(reject("empty title".to_string()));
            continue;
        }
        if let Some(reason) = rules.exclusion_reason(candidate) {
            resolved.rejected.push(reject(reason));
            continue;
        }
        if !seen.insert(offer.id.clone()) {
            resolved.rejected.push(reject(format!("duplicate id '{}'", offer.id)));
            continue;
        }
        resolved.offers.push(offer);
    }

    resolved
}

/// Convert one raw offer to an [`Offer`], or `None` if no id can be derived.
pub fn to_offer(raw: &RawOffer, base_url: Option<&str>) -> Option<Offer> {
    let url = canonical_url(&raw.url, base_url)?;
    let id = offer_id(&url).filter(|id| id.trim() == id.as_str())?;
    Some(Offer {
        id,
        title: raw.title.trim().to_string(),
        url: url.into(),
        tags: raw.tags.clone(),
        base_of: None,
    })
}

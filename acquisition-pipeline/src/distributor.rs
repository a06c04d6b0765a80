use common::{
    error::AppError,
    utils::config::{CategoryConfig, CollectionConfig},
};
use tracing::debug;

use crate::types::KeywordTarget;

/// Validates `config` and returns its per-keyword targets, distributed over
/// the global minimum. Touches neither the network nor the store.
pub fn plan(config: &CollectionConfig) -> Result<Vec<KeywordTarget>, AppError> {
    config.validate()?;
    targets_for(config)
}

/// Per-keyword targets for an already validated configuration.
pub fn targets_for(config: &CollectionConfig) -> Result<Vec<KeywordTarget>, AppError> {
    distribute(
        config.global_target.min,
        &config.categories,
        config.per_keyword_cap,
        config.relevance_threshold,
    )
}

/// Splits `global_target` across categories by weight, then evenly across each
/// category's keywords.
///
/// Every split uses floor division, so the sum of the returned targets never
/// exceeds `global_target`. Targets come back in category order, then keyword
/// order. `default_threshold` becomes the scoring base of keywords without their
/// own `relevance_base`.
pub fn distribute(
    global_target: usize,
    categories: &[CategoryConfig],
    per_keyword_cap: Option<usize>,
    default_threshold: f32,
) -> Result<Vec<KeywordTarget>, AppError> {
    if categories.is_empty() {
        return Err(AppError::Configuration(
            "At least one category is required".to_string(),
        ));
    }

    for category in categories {
        if !category.weight.is_finite() || category.weight <= 0.0 {
            return Err(AppError::Configuration(format!(
                "Category '{}' has invalid weight {}",
                category.name, category.weight
            )));
        }
        if category.keywords.is_empty() {
            return Err(AppError::Configuration(format!(
                "Category '{}' has no keywords",
                category.name
            )));
        }
    }

    let total_weight: f64 = categories.iter().map(|c| c.weight).sum();
    let mut remaining = global_target;
    let mut targets = Vec::new();

    for category in categories {
        let share = category_share(global_target, category.weight, total_weight).min(remaining);
        remaining = remaining.saturating_sub(share);

        let keyword_count = category.keywords.len();
        let per_keyword = share.checked_div(keyword_count).unwrap_or(0);
        let per_keyword = per_keyword_cap.map_or(per_keyword, |cap| per_keyword.min(cap));

        debug!(
            category = %category.name,
            category_target = share,
            keywords = keyword_count,
            per_keyword,
            "distributed category target"
        );

        for keyword in &category.keywords {
            targets.push(KeywordTarget {
                keyword: keyword.term.trim().to_string(),
                category: category.name.clone(),
                subcategory: keyword
                    .sub_target
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| category.name.clone()),
                target_count: per_keyword,
                relevance_threshold: keyword.relevance_base.unwrap_or(default_threshold),
            });
        }
    }

    Ok(targets)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn category_share(global_target: usize, weight: f64, total_weight: f64) -> usize {
    let share = (global_target as f64 * weight / total_weight).floor();
    if share.is_finite() && share > 0.0 {
        share as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::KeywordConfig;

    fn keyword(term: &str) -> KeywordConfig {
        KeywordConfig {
            term: term.to_string(),
            sub_target: None,
            relevance_base: None,
        }
    }

    fn category(name: &str, weight: f64, terms: &[&str]) -> CategoryConfig {
        CategoryConfig {
            name: name.to_string(),
            weight,
            keywords: terms.iter().map(|t| keyword(t)).collect(),
        }
    }

    #[test]
    fn splits_by_weight_then_evenly() {
        let categories = vec![
            category("anime", 2.0, &["anime girl", "anime boy"]),
            category("cartoon", 1.0, &["cartoon hero", "cartoon villain"]),
        ];

        let targets = distribute(100, &categories, None, 0.85).expect("distribute");
        let counts: Vec<usize> = targets.iter().map(|t| t.target_count).collect();

        assert_eq!(counts, vec![33, 33, 16, 16]);
        let anime: usize = counts.iter().take(2).sum();
        let cartoon: usize = counts.iter().skip(2).sum();
        assert_eq!((anime, cartoon), (66, 32));
        assert!(counts.iter().sum::<usize>() <= 100);
        assert_eq!(targets.first().map(|t| t.keyword.as_str()), Some("anime girl"));
        assert_eq!(targets.last().map(|t| t.keyword.as_str()), Some("cartoon villain"));
    }

    #[test]
    fn never_exceeds_global_target() {
        let weight_sets: [&[f64]; 5] = [
            &[1.0],
            &[1.0, 1.0, 1.0],
            &[0.1, 0.2, 0.7],
            &[3.3, 1.7, 0.01, 9.0],
            &[1e-6, 1e6],
        ];

        for weights in weight_sets {
            let categories: Vec<CategoryConfig> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| category(&format!("c{i}"), *w, &["a", "b", "c"]))
                .collect();

            for global in [0_usize, 1, 7, 99, 100, 1001] {
                let targets = distribute(global, &categories, None, 0.85).expect("distribute");
                let sum: usize = targets.iter().map(|t| t.target_count).sum();
                assert!(sum <= global, "{weights:?} @ {global}: {sum}");
            }
        }
    }

    #[test]
    fn applies_cap_subcategory_and_threshold_override() {
        let mut categories = vec![category("anime", 1.0, &["anime girl", "anime boy"])];
        if let Some(first) = categories.first_mut().and_then(|c| c.keywords.first_mut()) {
            first.sub_target = Some("female".into());
            first.relevance_base = Some(0.8);
        }

        let targets = distribute(100, &categories, Some(10), 0.9).expect("distribute");

        assert!(targets.iter().all(|t| t.target_count == 10));
        let first = targets.first().expect("first");
        assert_eq!(first.subcategory, "female");
        assert!((first.relevance_threshold - 0.8).abs() < f32::EPSILON);
        let second = targets.get(1).expect("second");
        assert_eq!(second.subcategory, "anime");
        assert!((second.relevance_threshold - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_invalid_category_sets() {
        assert!(matches!(
            distribute(10, &[], None, 0.85),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            distribute(10, &[category("a", 0.0, &["x"])], None, 0.85),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            distribute(10, &[category("a", f64::NAN, &["x"])], None, 0.85),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            distribute(10, &[category("a", 1.0, &[])], None, 0.85),
            Err(AppError::Configuration(_))
        ));
    }
}

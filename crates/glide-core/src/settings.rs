//! Engine tunables loaded from TOML.
//!
//! Three layers are merged once, at construction, into an explicit
//! [`Settings`] value that the engine owns:
//!
//! 1. defaults embedded via `include_str!("default_settings.toml")`
//! 2. an optional host TOML overlay with the same layout
//! 3. per-store params named `section.key` (see [`param_names`])
//!
//! A key missing from every layer is a parse error.

use std::collections::HashMap;

use serde::Deserialize;

pub const DEFAULT_SETTINGS_TOML: &str = include_str!("default_settings.toml");

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub guess: GuessSettings,
    pub filter: FilterSettings,
    pub learn: LearnSettings,
    pub backtrack: BacktrackSettings,
    pub quality: QualitySettings,
    pub tuning: TuningSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuessSettings {
    pub max_candidates: usize,
    pub star_bonus: f64,
    pub no_new_word_threshold: usize,
    pub curve_pow: f64,
    pub capital_penalty: f64,
    /// Predict weight at quality index 0.
    pub coef_low: f64,
    /// Predict weight at quality index 1.
    pub coef_high: f64,
    pub history_size: usize,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSettings {
    pub max_weight: f64,
    pub coef: f64,
    pub curve_gap: f64,
    pub implausible_ratio: f64,
    pub min_count: u64,
    pub cluster_min_count: u64,
    pub user_min_samples: f64,
    pub ramp_ratio: f64,
    pub reject_coef: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearnSettings {
    pub commit_delay_secs: u64,
    pub half_life_days: f64,
    pub purge_interval_days: u32,
    pub purge_min_count: f64,
    pub purge_max_age_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktrackSettings {
    pub min_gain: f64,
    pub max_predict_loss: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualitySettings {
    pub window: usize,
    pub percentile: f64,
    /// `low` is clamped to at least `high * min_ratio`; 0 disables.
    pub min_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuningSettings {
    pub tune_rate: f64,
    pub coef_min: f64,
    pub coef_max: f64,
}

impl Default for Settings {
    fn default() -> Self {
        parse_settings_toml(DEFAULT_SETTINGS_TOML).expect("settings TOML must be valid")
    }
}

impl Settings {
    /// Merge the three configuration layers over the embedded defaults.
    pub fn layered(
        host_toml: Option<&str>,
        params: &HashMap<String, String>,
    ) -> Result<Settings, SettingsError> {
        layered_over(DEFAULT_SETTINGS_TOML, host_toml, params)
    }
}

/// All `section.key` names known to the default layer.
pub fn param_names() -> Vec<String> {
    let Ok(table) = parse_table(DEFAULT_SETTINGS_TOML) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for (section, value) in &table {
        if let toml::Value::Table(inner) = value {
            for key in inner.keys() {
                names.push(format!("{section}.{key}"));
            }
        }
    }
    names.sort();
    names
}

pub fn parse_settings_toml(toml_str: &str) -> Result<Settings, SettingsError> {
    let s: Settings = toml::from_str(toml_str).map_err(|e| SettingsError::Parse(e.to_string()))?;
    validate(&s)?;
    Ok(s)
}

/// Merge `host_toml` and `params` over `base` and deserialize the result.
pub fn layered_over(
    base: &str,
    host_toml: Option<&str>,
    params: &HashMap<String, String>,
) -> Result<Settings, SettingsError> {
    let mut merged = parse_table(base)?;
    if let Some(host) = host_toml {
        merge_tables(&mut merged, parse_table(host)?);
    }

    let mut names: Vec<&String> = params.keys().collect();
    names.sort();
    for name in names {
        let Some((section, key)) = name.split_once('.') else {
            continue;
        };
        let value = parse_param_value(name, &params[name])?;
        let entry = merged
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(inner) = entry {
            inner.insert(key.to_string(), value);
        }
    }

    let s: Settings = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| SettingsError::Parse(e.to_string()))?;
    validate(&s)?;
    Ok(s)
}

fn parse_table(toml_str: &str) -> Result<toml::Table, SettingsError> {
    toml_str
        .parse::<toml::Table>()
        .map_err(|e| SettingsError::Parse(e.to_string()))
}

/// Params are stored as TOML scalar literals (`"0.4"`, `"25"`).
fn parse_param_value(name: &str, raw: &str) -> Result<toml::Value, SettingsError> {
    let doc = format!("v = {raw}");
    let mut table = parse_table(&doc).map_err(|_| SettingsError::InvalidValue {
        field: name.to_string(),
        reason: format!("not a TOML value: {raw}"),
    })?;
    table.remove("v").ok_or_else(|| SettingsError::InvalidValue {
        field: name.to_string(),
        reason: "empty value".to_string(),
    })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(over) => match base.get_mut(&key) {
                Some(toml::Value::Table(inner)) => merge_tables(inner, over),
                _ => {
                    base.insert(key, toml::Value::Table(over));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

fn validate(s: &Settings) -> Result<(), SettingsError> {
    macro_rules! check_non_negative {
        ($section:ident . $field:ident) => {
            if s.$section.$field < 0.0 {
                return Err(SettingsError::InvalidValue {
                    field: concat!(stringify!($section), ".", stringify!($field)).to_string(),
                    reason: "must be non-negative".to_string(),
                });
            }
        };
    }
    macro_rules! check_positive {
        ($section:ident . $field:ident) => {
            if s.$section.$field <= 0.0 {
                return Err(SettingsError::InvalidValue {
                    field: concat!(stringify!($section), ".", stringify!($field)).to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        };
    }
    macro_rules! check_positive_usize {
        ($section:ident . $field:ident) => {
            if s.$section.$field == 0 {
                return Err(SettingsError::InvalidValue {
                    field: concat!(stringify!($section), ".", stringify!($field)).to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        };
    }

    check_positive_usize!(guess.max_candidates);
    check_positive_usize!(guess.history_size);
    check_positive_usize!(guess.cache_size);
    check_non_negative!(guess.star_bonus);
    check_non_negative!(guess.curve_pow);
    check_non_negative!(guess.capital_penalty);
    check_non_negative!(guess.coef_low);
    check_non_negative!(guess.coef_high);

    check_positive!(filter.max_weight);
    check_positive!(filter.coef);
    check_non_negative!(filter.curve_gap);
    check_non_negative!(filter.implausible_ratio);
    check_positive!(filter.user_min_samples);
    check_positive!(filter.ramp_ratio);
    check_non_negative!(filter.reject_coef);

    check_positive!(learn.half_life_days);
    check_non_negative!(learn.purge_min_count);

    check_non_negative!(backtrack.min_gain);
    check_non_negative!(backtrack.max_predict_loss);

    check_positive_usize!(quality.window);
    check_non_negative!(quality.min_ratio);
    if !(0.0..0.5).contains(&s.quality.percentile) {
        return Err(SettingsError::InvalidValue {
            field: "quality.percentile".to_string(),
            reason: "must be in [0, 0.5)".to_string(),
        });
    }

    check_non_negative!(tuning.tune_rate);
    check_non_negative!(tuning.coef_min);
    if s.tuning.coef_max < s.tuning.coef_min {
        return Err(SettingsError::InvalidValue {
            field: "tuning.coef_max".to_string(),
            reason: "must not be below tuning.coef_min".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_toml() {
        let s = parse_settings_toml(DEFAULT_SETTINGS_TOML).unwrap();
        assert_eq!(s.guess.max_candidates, 25);
        assert_eq!(s.guess.history_size, 10);
        assert!((s.quality.percentile - 0.05).abs() < f64::EPSILON);
        assert_eq!(s.quality.window, 500);
        assert!((s.filter.max_weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn host_overlay_replaces_single_keys() {
        let host = r#"
[guess]
max_candidates = 8

[learn]
half_life_days = 30.0
"#;
        let s = Settings::layered(Some(host), &HashMap::new()).unwrap();
        assert_eq!(s.guess.max_candidates, 8);
        assert!((s.learn.half_life_days - 30.0).abs() < f64::EPSILON);
        // Untouched keys keep their defaults.
        assert!((s.guess.coef_low - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn store_params_win_over_host() {
        let host = "[guess]\ncoef_low = 0.9\n";
        let mut params = HashMap::new();
        params.insert("guess.coef_low".to_string(), "0.4".to_string());
        let s = Settings::layered(Some(host), &params).unwrap();
        assert!((s.guess.coef_low - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_key_everywhere_is_an_error() {
        let base = DEFAULT_SETTINGS_TOML.replace("coef_high = 0.25\n", "");
        let err = layered_over(&base, None, &HashMap::new()).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
        assert!(err.to_string().contains("coef_high"));
    }

    #[test]
    fn missing_key_supplied_by_param() {
        let base = DEFAULT_SETTINGS_TOML.replace("coef_high = 0.25\n", "");
        let mut params = HashMap::new();
        params.insert("guess.coef_high".to_string(), "0.3".to_string());
        let s = layered_over(&base, None, &params).unwrap();
        assert!((s.guess.coef_high - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn error_garbage_param() {
        let mut params = HashMap::new();
        params.insert("guess.coef_low".to_string(), "not a number".to_string());
        let err = Settings::layered(None, &params).unwrap_err();
        assert!(err.to_string().contains("guess.coef_low"));
    }

    #[test]
    fn error_negative_coef() {
        let host = "[guess]\ncoef_low = -1.0\n";
        let err = Settings::layered(Some(host), &HashMap::new()).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
        assert!(err.to_string().contains("guess.coef_low"));
    }

    #[test]
    fn error_zero_half_life() {
        let host = "[learn]\nhalf_life_days = 0.0\n";
        let err = Settings::layered(Some(host), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("half_life_days"));
    }

    #[test]
    fn error_percentile_out_of_range() {
        let host = "[quality]\npercentile = 0.7\n";
        let err = Settings::layered(Some(host), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("quality.percentile"));
    }

    #[test]
    fn param_names_cover_every_section() {
        let names = param_names();
        assert!(names.contains(&"guess.coef_low".to_string()));
        assert!(names.contains(&"quality.window".to_string()));
        assert!(names.contains(&"tuning.coef_max".to_string()));
    }

    #[test]
    fn error_invalid_toml() {
        let err = parse_settings_toml("not valid toml {{{").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }
}

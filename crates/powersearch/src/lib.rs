//! Public facade for `powersearch`.
//!
//! Re-exports the backend-agnostic records, traits and filters from `powersearch-core`; no IO
//! or backend code lives here.

pub use powersearch_core::*;

#[cfg(test)]
mod tests {
    #[test]
    fn facade_exposes_filters_and_records() {
        let raw = vec![
            crate::RawResult {
                url: Some("https://a".into()),
                score: Some(1.0),
                ..Default::default()
            },
            crate::RawResult {
                url: Some("https://b".into()),
                score: Some(2.0),
                ..Default::default()
            },
        ];
        let top = crate::filter::filter_by_top_k(&raw, 1);
        assert_eq!(top[0].url.as_deref(), Some("https://b"));
        assert_eq!(crate::VALID_TIME_RANGES, ["day", "month", "year"]);
    }
}

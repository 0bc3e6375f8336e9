//! Utility functions for timestamps and bounded text handling.

pub mod text;
pub mod timestamps;

pub use text::{tail, word_count};
pub use timestamps::{format_timestamp, iso_timestamp, Timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        // RFC3339 with an explicit UTC offset: YYYY-MM-DDTHH:MM:SS.ffffff+00:00
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}

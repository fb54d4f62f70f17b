use std::fmt;

/// Arguments of a reply chunk, decoded from the `key=value&...` line that
/// follows each chunk separator.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Args {
    raw: String,
    pairs: Vec<(String, String)>,
}

impl Args {
    /// Parse an argument line. Keys and values are percent-decoded, with `+`
    /// standing for a space.
    pub fn parse(line: &[u8]) -> Self {
        let pairs = url::form_urlencoded::parse(line)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Self {
            raw: String::from_utf8_lossy(line).into_owned(),
            pairs,
        }
    }

    /// Get the value of the first argument named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all arguments in the order they appear on the line.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The argument line as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding() {
        let args = Args::parse(b"item_id=1&status=not%20found&reason=a+b");

        assert_eq!(args.get("item_id"), Some("1"));
        assert_eq!(args.get("status"), Some("not found"));
        assert_eq!(args.get("reason"), Some("a b"));
        assert_eq!(args.get("size"), None);
    }

    #[test]
    fn first_value_wins() {
        let args = Args::parse(b"n_chunks=2&n_chunks=3");

        assert_eq!(args.get("n_chunks"), Some("2"));
        assert_eq!(args.iter().count(), 2);
    }

    #[test]
    fn display_keeps_raw_line() {
        let line = "item_type=blob&chunk_type=data&size=10";

        assert_eq!(Args::parse(line.as_bytes()).to_string(), line);
    }
}

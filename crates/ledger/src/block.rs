use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// One indivisible unit of transfer work: a byte range of a file, or a
/// whole file when planning a directory tree.
///
/// Equality and hashing only look at [`id`](Self::id). Two values with the
/// same id are the same block even if their ranges differ; pending-set
/// computation relies on this.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub id: u64,
    pub offset: u64,
    pub length: u64,
    /// Source or target path of the block. Must not contain a line break.
    pub locator: String,
}

/// Error returned when a ledger line is not a serialized [`BlockInfo`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseBlockError {
    #[error("expected `<id>:<offset>:<length>:<locator>`, got {0:?}")]
    Shape(String),

    #[error("invalid {field} {value:?}")]
    Number { field: &'static str, value: String },

    #[error("range {offset}+{length} overflows")]
    Overflow { offset: u64, length: u64 },
}

impl BlockInfo {
    pub fn new(id: u64, offset: u64, length: u64, locator: impl Into<String>) -> Self {
        Self {
            id,
            offset,
            length,
            locator: locator.into(),
        }
    }

    /// Exclusive end offset of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Encodes the block as `<id>:<offset>:<length>:<locator>`.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Decodes a line produced by [`serialize`](Self::serialize).
    ///
    /// The locator is the last field and may itself contain `:`.
    pub fn parse(line: &str) -> Result<Self, ParseBlockError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut fields = line.splitn(4, ':');
        let (Some(id), Some(offset), Some(length), Some(locator)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ParseBlockError::Shape(line.to_string()));
        };

        let id = parse_u64("block id", id)?;
        let offset = parse_u64("offset", offset)?;
        let length = parse_u64("length", length)?;
        if offset.checked_add(length).is_none() {
            return Err(ParseBlockError::Overflow { offset, length });
        }

        Ok(Self {
            id,
            offset,
            length,
            locator: locator.to_string(),
        })
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ParseBlockError> {
    value.parse().map_err(|_| ParseBlockError::Number {
        field,
        value: value.to_string(),
    })
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.id, self.offset, self.length, self.locator
        )
    }
}

impl FromStr for BlockInfo {
    type Err = ParseBlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for BlockInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BlockInfo {}

impl Hash for BlockInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn serialize_format() {
        let block = BlockInfo::new(7, 4096, 1024, "data/part.csv");
        assert_eq!(block.serialize(), "7:4096:1024:data/part.csv");
    }

    #[test]
    fn parse_restores_all_fields() {
        let block = BlockInfo::parse("3:100:50:/tmp/in.txt").unwrap();
        assert_eq!(block.id, 3);
        assert_eq!(block.offset, 100);
        assert_eq!(block.length, 50);
        assert_eq!(block.locator, "/tmp/in.txt");
        assert_eq!(block.end(), 150);
    }

    #[test]
    fn locator_may_contain_colons() {
        let block = BlockInfo::new(1, 0, 10, r"C:\data\in.csv");
        let parsed: BlockInfo = block.serialize().parse().unwrap();
        assert_eq!(parsed.locator, r"C:\data\in.csv");

        let parsed = BlockInfo::parse("2:0:1:oss://bucket/a:b").unwrap();
        assert_eq!(parsed.locator, "oss://bucket/a:b");
    }

    #[test]
    fn empty_locator_is_allowed() {
        let parsed = BlockInfo::parse("9:0:0:").unwrap();
        assert_eq!(parsed.id, 9);
        assert!(parsed.locator.is_empty());
    }

    #[test]
    fn trailing_carriage_return_ignored() {
        let parsed = BlockInfo::parse("4:8:16:file.bin\r").unwrap();
        assert_eq!(parsed.locator, "file.bin");
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(matches!(
            BlockInfo::parse("1:2:3"),
            Err(ParseBlockError::Shape(_))
        ));
        assert!(matches!(BlockInfo::parse(""), Err(ParseBlockError::Shape(_))));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let err = BlockInfo::parse("x:0:1:f").unwrap_err();
        assert_eq!(
            err,
            ParseBlockError::Number {
                field: "block id",
                value: "x".into()
            }
        );
        assert!(BlockInfo::parse("1:-5:1:f").is_err());
        assert!(BlockInfo::parse("1:0: 1:f").is_err());
    }

    #[test]
    fn rejects_overflowing_range() {
        let line = format!("1:{}:1:f", u64::MAX);
        assert!(matches!(
            BlockInfo::parse(&line),
            Err(ParseBlockError::Overflow { .. })
        ));
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = BlockInfo::new(5, 0, 100, "a");
        let b = BlockInfo::new(5, 900, 1, "b");
        let c = BlockInfo::new(6, 0, 100, "a");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<BlockInfo> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}

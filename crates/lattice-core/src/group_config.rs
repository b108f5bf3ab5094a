// Group config: embedding table shapes for sparse feature groups
//
// Sparse categorical features are partitioned into groups; each group owns an
// embedding table of `embedding_row x embedding_col`. Group embedding lookup
// operators read a GroupConfig to declare one variable per group.
//
// TEXT FORMATS:
//
//   File, one item per line (whitespace separated):
//       group_id embedding_row embedding_col
//     Lines containing '#' or '//' are comments. Blank lines are skipped.
//
//   Inline, comma separated:
//       group_id:col            (row = 1)
//       group_id:row:col
//     e.g. "1:4,2:8" or "1:1000:8,2:500:8"
//
// Both forms reject empty results and duplicate group ids. The max group id
// plus one is exposed for sizing dense group-indexed arrays.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::info;

use crate::error::{Error, Result};

/// Largest accepted group id (18-bit group layout).
pub const MAX_GROUP_ID: u32 = (1 << 18) - 1;

/// One group's embedding table shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupConfigItem {
    pub group_id: u32,
    pub embedding_row: usize,
    pub embedding_col: usize,
}

impl GroupConfigItem {
    pub fn new(group_id: u32, embedding_row: usize, embedding_col: usize) -> Self {
        GroupConfigItem {
            group_id,
            embedding_row,
            embedding_col,
        }
    }

    /// Validate the item's ranges.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.group_id > MAX_GROUP_ID {
            return Err(format!("invalid group id: {}", self.group_id));
        }
        if self.embedding_row == 0 {
            return Err(format!("invalid embedding row: {}", self.embedding_row));
        }
        if self.embedding_col == 0 {
            return Err(format!("invalid embedding col: {}", self.embedding_col));
        }
        match self.embedding_row.checked_mul(self.embedding_col) {
            Some(n) if n <= i32::MAX as usize => Ok(()),
            _ => Err(format!(
                "too large embedding row and embedding col: {} {}",
                self.embedding_row, self.embedding_col
            )),
        }
    }
}

/// A validated set of group items with unique ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupConfig {
    items: Vec<GroupConfigItem>,
}

impl GroupConfig {
    /// Validate items and build a config. Rejects empty input.
    pub fn from_items(items: Vec<GroupConfigItem>) -> Result<Self> {
        let mut builder = Builder::default();
        for item in items {
            builder.push(item, None)?;
        }
        builder.finish()
    }

    /// Load the file form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(None, format!("failed to open {}: {e}", path.display()))
        })?;
        let config = Self::parse_lines(&text)?;
        info!("Loaded {} groups from {}.", config.len(), path.display());
        Ok(config)
    }

    /// Parse the inline form.
    pub fn parse(info: &str) -> Result<Self> {
        let mut builder = Builder::default();
        for str_item in info.split(',').filter(|s| !s.trim().is_empty()) {
            let fields = str_item
                .split(':')
                .map(|f| f.trim().parse::<i64>())
                .collect::<std::result::Result<Vec<i64>, _>>()
                .map_err(|_| Error::config(None, format!("invalid item: {str_item}")))?;
            let (group_id, row, col) = match fields.as_slice() {
                &[group_id, col] => (group_id, 1, col),
                &[group_id, row, col] => (group_id, row, col),
                _ => return Err(Error::config(None, format!("invalid item: {str_item}"))),
            };
            builder.push(to_item(group_id, row, col, None)?, None)?;
        }
        let config = builder.finish()?;
        info!("Loaded {} groups.", config.len());
        Ok(config)
    }

    /// Load `file_or_info` as a file if it names an existing file, otherwise
    /// parse it inline.
    pub fn guess(file_or_info: &str) -> Result<Self> {
        if file_or_info.is_empty() {
            return Err(Error::config(None, "empty group config"));
        }
        if Path::new(file_or_info).is_file() {
            Self::load(file_or_info)
        } else {
            Self::parse(file_or_info)
        }
    }

    fn parse_lines(text: &str) -> Result<Self> {
        let mut builder = Builder::default();
        for (i, line) in text.lines().enumerate() {
            let lineno = Some(i + 1);
            if line.contains('#') || line.contains("//") || line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let parsed = fields
                .iter()
                .take(3)
                .map(|f| f.parse::<i64>())
                .collect::<std::result::Result<Vec<i64>, _>>();
            let item = match parsed.as_deref() {
                Ok(&[group_id, row, col]) => to_item(group_id, row, col, lineno)?,
                _ => return Err(Error::config(lineno, format!("invalid line: {line}"))),
            };
            builder.push(item, lineno)?;
        }
        builder.finish()
    }

    pub fn items(&self) -> &[GroupConfigItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.items.iter().map(|item| item.group_id).collect()
    }

    /// Largest group id plus one.
    pub fn max_group_id(&self) -> u32 {
        self.items
            .iter()
            .map(|item| item.group_id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Sum of every group's embedding column count.
    pub fn total_embedding_col(&self) -> usize {
        self.items.iter().map(|item| item.embedding_col).sum()
    }

    /// The logistic-regression view: same rows, one column per group.
    pub fn lr(&self) -> GroupConfig {
        GroupConfig {
            items: self
                .items
                .iter()
                .map(|item| GroupConfigItem {
                    embedding_col: 1,
                    ..*item
                })
                .collect(),
        }
    }

    /// All groups share one column count (factorization-machine compatible).
    pub fn is_fm(&self) -> bool {
        match self.items.first() {
            Some(first) => self
                .items
                .iter()
                .all(|item| item.embedding_col == first.embedding_col),
            None => false,
        }
    }

    /// Like [`GroupConfig::is_fm`], reporting the first inconsistency.
    pub fn check_fm(&self) -> Result<()> {
        let first = self
            .items
            .first()
            .ok_or_else(|| Error::config(None, "items is empty"))?;
        for item in &self.items {
            if item.embedding_col != first.embedding_col {
                return Err(Error::config(
                    None,
                    format!(
                        "inconsistent embedding col: {} vs {}",
                        first.embedding_col, item.embedding_col
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn to_item(group_id: i64, row: i64, col: i64, line: Option<usize>) -> Result<GroupConfigItem> {
    let group_id = u32::try_from(group_id)
        .map_err(|_| Error::config(line, format!("invalid group id: {group_id}")))?;
    let row = usize::try_from(row)
        .map_err(|_| Error::config(line, format!("invalid embedding row: {row}")))?;
    let col = usize::try_from(col)
        .map_err(|_| Error::config(line, format!("invalid embedding col: {col}")))?;
    Ok(GroupConfigItem::new(group_id, row, col))
}

#[derive(Default)]
struct Builder {
    items: Vec<GroupConfigItem>,
    seen: HashSet<u32>,
}

impl Builder {
    fn push(&mut self, item: GroupConfigItem, line: Option<usize>) -> Result<()> {
        item.check().map_err(|m| Error::config(line, m))?;
        if !self.seen.insert(item.group_id) {
            return Err(Error::config(
                line,
                format!("duplicate group id: {}", item.group_id),
            ));
        }
        self.items.push(item);
        Ok(())
    }

    fn finish(self) -> Result<GroupConfig> {
        if self.items.is_empty() {
            return Err(Error::config(None, "no groups"));
        }
        Ok(GroupConfig { items: self.items })
    }
}

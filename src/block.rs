//! Block：一组等长、具名、带类型的列

use crate::common::{MergeTreeError, Result};
use crate::field_type::{DataType, Value};

/// 列名 + 类型（`columns.txt` 中的一行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name:      String,
    pub data_type: DataType,
}

impl ColumnDesc {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self { name: name.into(), data_type }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnWithTypeAndName {
    pub name:      String,
    pub data_type: DataType,
    pub values:    Vec<Value>,
}

impl ColumnWithTypeAndName {
    pub fn new(name: &str, data_type: DataType, values: Vec<Value>) -> Self {
        Self { name: name.into(), data_type, values }
    }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
    pub fn desc(&self) -> ColumnDesc { ColumnDesc::new(&self.name, self.data_type.clone()) }
}

/// 行数单独记录：所有请求列都缺失时，block 可以只有行数没有列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    columns: Vec<ColumnWithTypeAndName>,
    rows:    usize,
}

impl Block {
    pub fn new() -> Self { Self::default() }

    /// 只有行数的空 block
    pub fn with_rows(rows: usize) -> Self {
        Self { columns: Vec::new(), rows }
    }

    pub fn from_columns(columns: Vec<ColumnWithTypeAndName>) -> Result<Self> {
        let mut block = Self::new();
        for c in columns {
            block.insert(c)?;
        }
        Ok(block)
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn num_columns(&self) -> usize { self.columns.len() }
    pub fn is_empty(&self) -> bool { self.rows == 0 }
    pub fn columns(&self) -> &[ColumnWithTypeAndName] { &self.columns }
    pub fn into_columns(self) -> Vec<ColumnWithTypeAndName> { self.columns }

    pub fn has(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn by_name(&self, name: &str) -> Option<&ColumnWithTypeAndName> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut ColumnWithTypeAndName> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn insert(&mut self, column: ColumnWithTypeAndName) -> Result<()> {
        let pos = self.columns.len();
        self.insert_at(pos, column)
    }

    pub fn insert_at(&mut self, pos: usize, column: ColumnWithTypeAndName) -> Result<()> {
        if self.has(&column.name) {
            return Err(MergeTreeError::SchemaMismatch(
                format!("duplicate column {} in block", column.name),
            ));
        }
        if (!self.columns.is_empty() || self.rows > 0) && column.len() != self.rows {
            return Err(MergeTreeError::SchemaMismatch(format!(
                "column {} has {} rows, block has {}", column.name, column.len(), self.rows,
            )));
        }
        self.rows = column.len();
        self.columns.insert(pos.min(self.columns.len()), column);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<ColumnWithTypeAndName> {
        let pos = self.position(name)?;
        Some(self.columns.remove(pos))
    }

    /// 按行掩码过滤所有列
    pub fn filter(&mut self, mask: &[bool]) -> Result<()> {
        if mask.len() != self.rows {
            return Err(MergeTreeError::Logical(format!(
                "filter has {} rows, block has {}", mask.len(), self.rows,
            )));
        }
        for col in &mut self.columns {
            let mut keep = mask.iter();
            col.values.retain(|_| keep.next().copied().unwrap_or(false));
        }
        self.rows = mask.iter().filter(|&&b| b).count();
        Ok(())
    }

    /// 把 `other` 的行追加到末尾；列集合必须一致
    pub fn append(&mut self, other: Block) -> Result<()> {
        if self.columns.is_empty() && self.rows == 0 {
            *self = other;
            return Ok(());
        }
        if other.columns.len() != self.columns.len() {
            return Err(MergeTreeError::SchemaMismatch("appending block with different columns".into()));
        }
        for col in other.columns {
            let dst = self.by_name_mut(&col.name).ok_or_else(|| {
                MergeTreeError::SchemaMismatch(format!("column {} not in block", col.name))
            })?;
            dst.values.extend(col.values);
        }
        self.rows += other.rows;
        Ok(())
    }

    /// 各列类型与值是否一致
    pub fn check_types(&self) -> Result<()> {
        for col in &self.columns {
            if let Some(bad) = col.values.iter().find(|v| !col.data_type.accepts(v)) {
                return Err(MergeTreeError::SchemaMismatch(format!(
                    "column {} of type {} holds value {bad}", col.name, col.data_type,
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(name: &str, v: &[i64]) -> ColumnWithTypeAndName {
        ColumnWithTypeAndName::new(name, DataType::Int64, v.iter().map(|&x| Value::Int64(x)).collect())
    }

    #[test]
    fn insert_rejects_length_mismatch() {
        let mut b = Block::new();
        b.insert(ints("a", &[1, 2, 3])).unwrap();
        assert!(b.insert(ints("b", &[1])).is_err());
        assert!(b.insert(ints("a", &[1, 2, 3])).is_err());
    }

    #[test]
    fn row_only_block_accepts_matching_column() {
        let mut b = Block::with_rows(2);
        assert_eq!(b.num_columns(), 0);
        assert!(b.insert(ints("a", &[1])).is_err());
        b.insert(ints("a", &[1, 2])).unwrap();
        assert_eq!(b.rows(), 2);
    }

    #[test]
    fn filter_and_append() {
        let mut b = Block::from_columns(vec![ints("a", &[1, 2, 3, 4])]).unwrap();
        b.filter(&[true, false, false, true]).unwrap();
        assert_eq!(b.by_name("a").unwrap().values, vec![Value::Int64(1), Value::Int64(4)]);

        b.append(Block::from_columns(vec![ints("a", &[9])]).unwrap()).unwrap();
        assert_eq!(b.rows(), 3);
    }
}

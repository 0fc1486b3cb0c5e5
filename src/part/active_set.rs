//! 一组互不覆盖的 part 名字
//!
//! 加入一个 part 时，被它覆盖的旧 part 自动移除；已被覆盖的名字直接忽略。
//! 复制队列用它维护 virtual parts。

use std::collections::BTreeSet;

use crate::common::Result;

use super::name::PartInfo;

#[derive(Debug, Default, Clone)]
pub struct ActivePartSet {
    parts: BTreeSet<PartInfo>,
}

impl ActivePartSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_names<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Result<Self> {
        let mut set = Self::new();
        for name in names {
            set.add(name)?;
        }
        Ok(set)
    }

    /// 返回是否真正加入（已被覆盖时为 false）
    pub fn add(&mut self, name: &str) -> Result<bool> {
        let info = PartInfo::parse(name)?;
        Ok(self.add_info(info))
    }

    pub fn add_info(&mut self, info: PartInfo) -> bool {
        if self.parts.iter().any(|p| p.contains(&info)) {
            return false;
        }
        self.parts.retain(|p| !info.contains(p));
        self.parts.insert(info);
        true
    }

    /// 覆盖 `name` 的 part（可能就是它自己）
    pub fn containing_part(&self, name: &str) -> Result<Option<String>> {
        let info = PartInfo::parse(name)?;
        Ok(self.parts.iter().find(|p| p.contains(&info)).map(|p| p.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let info = PartInfo::parse(name)?;
        Ok(self.parts.remove(&info))
    }

    pub fn parts(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.to_string()).collect()
    }

    pub fn len(&self) -> usize { self.parts.len() }
    pub fn is_empty(&self) -> bool { self.parts.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_part_replaces_sources() {
        let mut set = ActivePartSet::from_names(["p_1_1_0", "p_2_2_0", "p_3_3_0"]).unwrap();
        assert!(set.add("p_1_2_1").unwrap());
        assert_eq!(set.parts(), vec!["p_1_2_1", "p_3_3_0"]);
        assert!(!set.add("p_2_2_0").unwrap());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn containing_part_lookup() {
        let set = ActivePartSet::from_names(["p_1_5_2", "q_1_1_0"]).unwrap();
        assert_eq!(set.containing_part("p_3_3_0").unwrap().as_deref(), Some("p_1_5_2"));
        assert_eq!(set.containing_part("p_6_6_0").unwrap(), None);
        assert!(set.containing_part("garbage").is_err());
    }
}

use std::collections::{HashMap, HashSet};

use crate::parser::BinaryResource;

/// 合并后资源 ID 的前缀
pub const GLOBAL_ID_PREFIX: &str = "img_";

/// 单个文档的 ID 映射：原始 ID -> 全局 ID
pub type IdMapping = HashMap<String, String>;

/// 合并后的资源表
///
/// 按加入顺序保存，全局 ID 互不重复
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    entries: Vec<(String, BinaryResource)>,
    ids: HashSet<String>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, global_id: &str) -> Option<&BinaryResource> {
        self.entries
            .iter()
            .find(|(id, _)| id == global_id)
            .map(|(_, resource)| resource)
    }

    /// 按加入顺序遍历 `(全局 ID, 资源)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BinaryResource)> {
        self.entries.iter().map(|(id, resource)| (id.as_str(), resource))
    }

    /// 生成一个表中不存在的全局 ID
    fn fresh_id(&self) -> String {
        loop {
            let id = format!("{}{}", GLOBAL_ID_PREFIX, uuid::Uuid::new_v4().simple());
            if !self.ids.contains(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, global_id: String, resource: BinaryResource) {
        self.ids.insert(global_id.clone());
        self.entries.push((global_id, resource));
    }
}

/// 为一个文档的资源分配全局 ID 并加入资源表
///
/// 已经在表中的资源不会被改动。同一文档内重复的原始 ID 只保留第一个。
///
/// # 参数
/// - `resources`: 该文档保留下来的图片资源
/// - `table`: 之前所有文档累积的资源表
///
/// # 返回
/// 该文档的 原始 ID -> 全局 ID 映射
pub fn remap(resources: Vec<BinaryResource>, table: &mut ResourceTable) -> IdMapping {
    let mut mapping = IdMapping::with_capacity(resources.len());

    for resource in resources {
        if mapping.contains_key(&resource.id) {
            tracing::debug!(id = %resource.id, "duplicate binary id skipped");
            continue;
        }
        let global_id = table.fresh_id();
        mapping.insert(resource.id.clone(), global_id.clone());
        table.insert(global_id, resource);
    }

    mapping
}

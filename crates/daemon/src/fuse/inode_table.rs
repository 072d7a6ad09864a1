//! Bidirectional inode ↔ path mapping for the FUSE shim
//!
//! Paths are rule-relative and `/`-separated; the mount root is `""`.

use std::collections::HashMap;

/// Bidirectional mapping between inodes and paths
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    /// Next free inode (1 is the root)
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.path_to_inode.insert(String::new(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, String::new());
        table
    }

    /// Get or create an inode for a path
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = Self::normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(normalized.to_string(), inode);
        self.inode_to_path.insert(inode, normalized.to_string());
        inode
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode
            .get(Self::normalize_path(path))
            .copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Forget a path and return its inode. The root is never removed.
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            return None;
        }
        let inode = self.path_to_inode.remove(normalized)?;
        self.inode_to_path.remove(&inode);
        Some(inode)
    }

    /// Move a path and everything below it, keeping inode numbers.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        let old = Self::normalize_path(old_path).to_string();
        let new = Self::normalize_path(new_path).to_string();
        if old.is_empty() || old == new {
            return;
        }

        // Whatever the target replaced is gone.
        self.remove_by_path(&new);

        let prefix = format!("{old}/");
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(path, _)| **path == old || path.starts_with(&prefix))
            .map(|(path, &inode)| (path.clone(), inode))
            .collect();

        for (path, inode) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.path_to_inode.remove(&path);
            self.path_to_inode.insert(renamed.clone(), inode);
            self.inode_to_path.insert(inode, renamed);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }

    /// Path of `name` inside directory `parent`.
    pub fn child_path(parent: &str, name: &str) -> String {
        let parent = Self::normalize_path(parent);
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    /// Parent directory of a path (the root is its own parent).
    pub fn parent_path(path: &str) -> &str {
        let normalized = Self::normalize_path(path);
        match normalized.rfind('/') {
            Some(pos) => &normalized[..pos],
            None => "",
        }
    }

    fn normalize_path(path: &str) -> &str {
        path.trim().trim_matches('/')
    }
}

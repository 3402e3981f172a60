//! The database handle: owns the page store, buffer pool, allocator, and
//! overflow store, and keeps the catalog page (tree root directory plus the
//! overflow store's active block) in sync.
//!
//! Construction and teardown are explicit. Teardown order: tree handles go
//! first, then allocator metadata persists, then the pool flushes, then the
//! store syncs and closes.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::PageAllocator;
use crate::btree::{BTree, OverflowStore};
use crate::buffer::{BufferPool, PoolStats};
use crate::common::{FIRST_GROUP_PAGE, INVALID_PAGE_ID, PageId, PAGES_PER_GROUP, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::store::PageStore;
use crate::Config;

const CATALOG_OFF_OVERFLOW: usize = 0;
const CATALOG_OFF_ROOT_COUNT: usize = 4;
const CATALOG_OFF_ROOTS: usize = 8;
const CATALOG_MAX_ROOTS: usize = (PAGE_SIZE - CATALOG_OFF_ROOTS) / 4;

pub struct Db {
    store: Arc<PageStore>,
    pool: Arc<BufferPool>,
    alloc: Arc<PageAllocator>,
    overflow: Arc<OverflowStore>,
    roots: Mutex<Vec<PageId>>,
}

impl Db {
    /// Create a new file-backed database. The file is sized for the
    /// metadata area plus one group.
    pub fn create<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let store = Arc::new(PageStore::create(
            path,
            FIRST_GROUP_PAGE + PAGES_PER_GROUP,
        )?);
        Self::create_on(store, config)
    }

    /// Create a new in-memory database, mostly useful for tests and
    /// ephemeral workloads.
    pub fn create_in_memory(config: &Config) -> Result<Self> {
        let store = Arc::new(PageStore::create_memory(FIRST_GROUP_PAGE + PAGES_PER_GROUP)?);
        Self::create_on(store, config)
    }

    fn create_on(store: Arc<PageStore>, config: &Config) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), config.pool_size));
        let alloc = Arc::new(PageAllocator::create(
            Arc::clone(&store),
            Arc::clone(&pool),
        )?);
        let overflow = Arc::new(OverflowStore::new(Arc::clone(&pool), Arc::clone(&alloc)));
        let db = Self {
            store,
            pool,
            alloc,
            overflow,
            roots: Mutex::new(Vec::new()),
        };
        db.persist_catalog()?;
        tracing::debug!("database created");
        Ok(db)
    }

    /// Open an existing database. Metadata validation failures are fatal.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let store = Arc::new(PageStore::open(path)?);
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), config.pool_size));
        let alloc = Arc::new(PageAllocator::open(Arc::clone(&store), Arc::clone(&pool))?);
        let overflow = Arc::new(OverflowStore::new(Arc::clone(&pool), Arc::clone(&alloc)));

        let mut buf = [0u8; PAGE_SIZE];
        alloc.read_catalog(&mut buf)?;
        let active = u32::from_le_bytes(
            buf[CATALOG_OFF_OVERFLOW..CATALOG_OFF_OVERFLOW + 4]
                .try_into()
                .unwrap(),
        );
        if active != INVALID_PAGE_ID && active >= FIRST_GROUP_PAGE {
            overflow.set_active_block(active);
        }
        let root_count = u32::from_le_bytes(
            buf[CATALOG_OFF_ROOT_COUNT..CATALOG_OFF_ROOT_COUNT + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        if root_count > CATALOG_MAX_ROOTS {
            return Err(DbError::CorruptedMetadata(format!(
                "catalog claims {} tree roots",
                root_count
            )));
        }
        let mut roots = Vec::with_capacity(root_count);
        for i in 0..root_count {
            let off = CATALOG_OFF_ROOTS + i * 4;
            roots.push(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
        }

        tracing::debug!(trees = roots.len(), "database opened");
        Ok(Self {
            store,
            pool,
            alloc,
            overflow,
            roots: Mutex::new(roots),
        })
    }

    fn persist_catalog(&self) -> Result<()> {
        let roots = self.roots.lock();
        let mut buf = [0u8; PAGE_SIZE];
        let active = self.overflow.active_block();
        buf[CATALOG_OFF_OVERFLOW..CATALOG_OFF_OVERFLOW + 4]
            .copy_from_slice(&active.to_le_bytes());
        buf[CATALOG_OFF_ROOT_COUNT..CATALOG_OFF_ROOT_COUNT + 4]
            .copy_from_slice(&(roots.len() as u32).to_le_bytes());
        for (i, root) in roots.iter().enumerate() {
            let off = CATALOG_OFF_ROOTS + i * 4;
            buf[off..off + 4].copy_from_slice(&root.to_le_bytes());
        }
        self.alloc.write_catalog(&buf)
    }

    /// Create a new tree and register its root in the catalog.
    pub fn create_tree(&self) -> Result<BTree> {
        {
            let roots = self.roots.lock();
            if roots.len() >= CATALOG_MAX_ROOTS {
                return Err(DbError::InvalidArgument("catalog is full".into()));
            }
        }
        let tree = BTree::create(
            Arc::clone(&self.pool),
            Arc::clone(&self.alloc),
            Arc::clone(&self.overflow),
        )?;
        self.roots.lock().push(tree.root_page());
        self.persist_catalog()?;
        Ok(tree)
    }

    /// Attach to a tree created earlier, by its root page number.
    pub fn open_tree(&self, root: PageId) -> Result<BTree> {
        if !self.roots.lock().contains(&root) {
            return Err(DbError::NotFound);
        }
        Ok(BTree::open(
            Arc::clone(&self.pool),
            Arc::clone(&self.alloc),
            Arc::clone(&self.overflow),
            root,
        ))
    }

    /// Drop a tree: free all of its pages and value storage and remove it
    /// from the catalog.
    pub fn drop_tree(&self, root: PageId) -> Result<()> {
        if !self.roots.lock().contains(&root) {
            return Err(DbError::NotFound);
        }
        let tree = BTree::open(
            Arc::clone(&self.pool),
            Arc::clone(&self.alloc),
            Arc::clone(&self.overflow),
            root,
        );
        tree.destroy()?;
        self.roots.lock().retain(|r| *r != root);
        self.persist_catalog()
    }

    /// Root pages of every registered tree, in creation order.
    pub fn tree_roots(&self) -> Vec<PageId> {
        self.roots.lock().clone()
    }

    #[inline]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.alloc
    }

    #[inline]
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Persist everything and shut down: catalog, allocator metadata, dirty
    /// pages, then the store itself.
    pub fn close(self) -> Result<()> {
        self.persist_catalog()?;
        self.alloc.destroy()?;
        self.pool.destroy()?;
        self.store.close()?;
        tracing::debug!("database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Key;
    use tempfile::tempdir;

    #[test]
    fn create_tree_registers_root() {
        let db = Db::create_in_memory(&Config::default()).unwrap();
        let t1 = db.create_tree().unwrap();
        let t2 = db.create_tree().unwrap();
        assert_ne!(t1.root_page(), t2.root_page());
        assert_eq!(db.tree_roots(), vec![t1.root_page(), t2.root_page()]);

        assert!(db.open_tree(t1.root_page()).is_ok());
        assert!(db.open_tree(INVALID_PAGE_ID).is_err());
    }

    #[test]
    fn drop_tree_releases_every_page() {
        let db = Db::create_in_memory(&Config::default()).unwrap();
        let free_before = db.allocator().group_free_pages(0);

        let tree = db.create_tree().unwrap();
        let root = tree.root_page();
        for i in 0..200i64 {
            // mixed value classes so overflow blocks and chains exist
            let len = 1 + (i as usize * 37) % 6000;
            tree.insert(&Key::from_i64(i), &vec![0xAB; len]).unwrap();
        }
        assert!(db.allocator().group_free_pages(0) < free_before);
        drop(tree);

        db.drop_tree(root).unwrap();
        assert_eq!(db.allocator().group_free_pages(0), free_before);
        assert!(db.tree_roots().is_empty());
        assert!(db.drop_tree(root).is_err());
    }

    #[test]
    fn close_and_reopen_preserves_trees() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.simdb");
        let config = Config::default();

        let root;
        {
            let db = Db::create(&path, &config).unwrap();
            let tree = db.create_tree().unwrap();
            root = tree.root_page();
            tree.insert(&Key::from_bytes(b"alpha").unwrap(), b"one").unwrap();
            tree.insert(&Key::from_bytes(b"beta").unwrap(), &[7u8; 2000])
                .unwrap();
            db.close().unwrap();
        }

        let db = Db::open(&path, &config).unwrap();
        assert_eq!(db.tree_roots(), vec![root]);
        let tree = db.open_tree(root).unwrap();
        assert_eq!(
            tree.search(&Key::from_bytes(b"alpha").unwrap()).unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            tree.search(&Key::from_bytes(b"beta").unwrap()).unwrap(),
            Some(vec![7u8; 2000])
        );
        db.close().unwrap();
    }
}

//! Per product/warehouse stock counters
use super::error::{AbortOnErr, OrderError, OrderResult, TxResult};
use super::types::TimeStamp;
use super::utils;
use chrono::Utc;
use sled::transaction::TransactionalTree;

pub const INVENTORY_TREE: &str = "inventory";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct InventoryCounter {
    #[n(0)]
    pub product_id: u64,
    #[n(1)]
    pub warehouse_id: String,
    #[n(2)]
    pub quantity_in_stock: u64,
    #[n(3)]
    pub minimum_level: u64, // advisory
    #[n(4)]
    pub maximum_level: u64, // advisory
    #[n(5)]
    pub updated_at: TimeStamp<Utc>,
}

impl InventoryCounter {
    fn empty(product_id: u64, warehouse_id: &str) -> Self {
        Self {
            product_id,
            warehouse_id: warehouse_id.to_string(),
            quantity_in_stock: 0,
            minimum_level: 0,
            maximum_level: 0,
            updated_at: TimeStamp::new(),
        }
    }

    pub fn is_below_minimum(&self) -> bool {
        self.quantity_in_stock < self.minimum_level
    }

    /// Applies a signed delta, refusing to go below zero.
    fn apply(&mut self, delta: i64) -> OrderResult<u64> {
        let next = if delta >= 0 {
            self.quantity_in_stock.checked_add(delta.unsigned_abs())
        } else {
            self.quantity_in_stock.checked_sub(delta.unsigned_abs())
        };
        let Some(next) = next else {
            return Err(OrderError::InsufficientStock {
                product_id: self.product_id,
                in_stock: self.quantity_in_stock,
                delta,
            });
        };
        self.quantity_in_stock = next;
        self.updated_at = TimeStamp::not_before(&self.updated_at);
        Ok(next)
    }
}

// product id big-endian so a prefix scan returns every warehouse of one product
fn counter_key(product_id: u64, warehouse_id: &str) -> Vec<u8> {
    let mut key = product_id.to_be_bytes().to_vec();
    key.extend_from_slice(warehouse_id.as_bytes());
    key
}

#[derive(Clone)]
pub struct InventoryStore {
    tree: sled::Tree,
}

impl InventoryStore {
    pub fn open(db: &sled::Db) -> OrderResult<Self> {
        Ok(Self {
            tree: db.open_tree(INVENTORY_TREE)?,
        })
    }

    pub fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    /// Creates a zero counter if none exists, otherwise updates the advisory levels.
    pub fn register(
        &self,
        product_id: u64,
        warehouse_id: &str,
        minimum_level: u64,
        maximum_level: u64,
    ) -> OrderResult<InventoryCounter> {
        let counter = self.tree.transaction(|tree| -> TxResult<InventoryCounter> {
            let mut counter = Self::load_or_empty_tx(tree, product_id, warehouse_id)?;
            counter.minimum_level = minimum_level;
            counter.maximum_level = maximum_level;
            Self::save_tx(tree, &counter)?;
            Ok(counter)
        })?;
        Ok(counter)
    }

    /// Standalone atomic adjustment, returns the new quantity.
    pub fn adjust(&self, product_id: u64, warehouse_id: &str, delta: i64) -> OrderResult<u64> {
        let quantity = self
            .tree
            .transaction(|tree| Self::adjust_tx(tree, product_id, warehouse_id, delta))?;
        tracing::debug!(product_id, warehouse_id, delta, quantity, "inventory adjusted");
        Ok(quantity)
    }

    /// Adjustment inside a caller's unit of work.
    pub(crate) fn adjust_tx(
        tree: &TransactionalTree,
        product_id: u64,
        warehouse_id: &str,
        delta: i64,
    ) -> TxResult<u64> {
        let mut counter = Self::load_or_empty_tx(tree, product_id, warehouse_id)?;
        let quantity = counter.apply(delta).or_abort()?;
        Self::save_tx(tree, &counter)?;
        Ok(quantity)
    }

    /// Quantity a delta would produce, without writing. Used to fail early before a saga
    /// reserves anything.
    pub fn check(&self, product_id: u64, warehouse_id: &str, delta: i64) -> OrderResult<u64> {
        let mut counter = self
            .get(product_id, warehouse_id)?
            .unwrap_or_else(|| InventoryCounter::empty(product_id, warehouse_id));
        counter.apply(delta)
    }

    pub fn get(&self, product_id: u64, warehouse_id: &str) -> OrderResult<Option<InventoryCounter>> {
        match self.tree.get(counter_key(product_id, warehouse_id))? {
            Some(bytes) => Ok(Some(utils::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_product(&self, product_id: u64) -> OrderResult<Vec<InventoryCounter>> {
        let mut out = vec![];
        for entry in self.tree.scan_prefix(product_id.to_be_bytes()) {
            let (_, bytes) = entry?;
            out.push(utils::decode(&bytes)?);
        }
        Ok(out)
    }

    /// Counters at or under `threshold` units.
    pub fn list_low(&self, threshold: u64) -> OrderResult<Vec<InventoryCounter>> {
        self.filter(|c| c.quantity_in_stock <= threshold)
    }

    pub fn below_minimum(&self) -> OrderResult<Vec<InventoryCounter>> {
        self.filter(InventoryCounter::is_below_minimum)
    }

    fn filter(&self, keep: impl Fn(&InventoryCounter) -> bool) -> OrderResult<Vec<InventoryCounter>> {
        let mut out = vec![];
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let counter: InventoryCounter = utils::decode(&bytes)?;
            if keep(&counter) {
                out.push(counter);
            }
        }
        Ok(out)
    }

    fn load_or_empty_tx(
        tree: &TransactionalTree,
        product_id: u64,
        warehouse_id: &str,
    ) -> TxResult<InventoryCounter> {
        match tree.get(counter_key(product_id, warehouse_id))? {
            Some(bytes) => utils::decode(&bytes).or_abort(),
            None => Ok(InventoryCounter::empty(product_id, warehouse_id)),
        }
    }

    fn save_tx(tree: &TransactionalTree, counter: &InventoryCounter) -> TxResult<()> {
        tree.insert(
            counter_key(counter.product_id, &counter.warehouse_id),
            utils::encode(counter).or_abort()?,
        )?;
        Ok(())
    }
}

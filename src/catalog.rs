//! Product price lookup
use super::error::{OrderError, OrderResult};
use super::types::Money;
use super::utils;

pub const PRODUCTS_TREE: &str = "products";

/// Price source consulted when an order is placed.
pub trait PriceLookup: Send + Sync {
    fn unit_price(&self, product_id: u64) -> OrderResult<Money>;
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Product {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub unit_price: Money,
}

/// Products persisted alongside the engine's other trees.
#[derive(Clone)]
pub struct ProductCatalog {
    tree: sled::Tree,
}

impl ProductCatalog {
    pub fn open(db: &sled::Db) -> OrderResult<Self> {
        Ok(Self {
            tree: db.open_tree(PRODUCTS_TREE)?,
        })
    }

    pub fn upsert(&self, product: &Product) -> OrderResult<()> {
        if !product.unit_price.is_positive() {
            return Err(OrderError::NonPositiveAmount(product.unit_price));
        }
        self.tree
            .insert(product.id.to_be_bytes(), utils::encode(product)?)?;
        Ok(())
    }

    pub fn get(&self, product_id: u64) -> OrderResult<Option<Product>> {
        match self.tree.get(product_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(utils::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl PriceLookup for ProductCatalog {
    fn unit_price(&self, product_id: u64) -> OrderResult<Money> {
        self.get(product_id)?
            .map(|p| p.unit_price)
            .ok_or(OrderError::UnknownProduct(product_id))
    }
}

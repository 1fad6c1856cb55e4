//! Optimal product selection.
//!
//! The optimal product for a request is the cheapest available SKU with a
//! positive spot price in the target region, tie-broken deterministically by
//! on-demand price and then id. Product listings are cached per filter set
//! for five minutes.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use novita_client::{Product, ProductFilters};
use tracing::debug;

use crate::kernel::cache::Cache;
use crate::kernel::traits::BaseProviderClient;

/// Region fallback order when the preferred region has no capacity.
pub const REGION_PRIORITY: [&str; 4] = ["CN-HK-01", "US-01", "EU-01", "AS-SGP-02"];

pub struct ProductResolver {
    provider: Arc<dyn BaseProviderClient>,
    cache: Arc<Cache>,
}

impl ProductResolver {
    pub fn new(provider: Arc<dyn BaseProviderClient>, cache: Arc<Cache>) -> Self {
        Self { provider, cache }
    }

    /// Pick the optimal product for `product_name` in `region`.
    pub async fn optimal_product(&self, product_name: &str, region: &str) -> Result<Product> {
        let products = self.products_for(product_name, region).await?;

        let mut candidates: Vec<Product> = products
            .into_iter()
            .filter(|p| p.is_available() && p.spot_price > 0.0 && p.region == region)
            .collect();

        if candidates.is_empty() {
            bail!(
                "no available spot product \"{}\" in region {}",
                product_name,
                region
            );
        }

        candidates.sort_by(|a, b| {
            a.spot_price
                .partial_cmp(&b.spot_price)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.on_demand_price
                        .partial_cmp(&b.on_demand_price)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(candidates.into_iter().next().unwrap())
    }

    /// Try regions in priority order, promoting the preferred region to the
    /// front. Returns the product and the region it was found in.
    pub async fn optimal_product_with_fallback(
        &self,
        product_name: &str,
        preferred_region: Option<&str>,
    ) -> Result<(Product, String)> {
        let mut regions: Vec<String> = Vec::new();
        if let Some(preferred) = preferred_region {
            regions.push(preferred.to_string());
        }
        for region in REGION_PRIORITY {
            if !regions.iter().any(|r| r == region) {
                regions.push(region.to_string());
            }
        }

        let mut errors = Vec::new();
        for region in &regions {
            match self.optimal_product(product_name, region).await {
                Ok(product) => {
                    debug!(product_id = %product.id, region = %region, "resolved optimal product");
                    return Ok((product, region.clone()));
                }
                Err(e) => errors.push(format!("{}: {}", region, e)),
            }
        }
        bail!(
            "product \"{}\" unavailable in every region: [{}]",
            product_name,
            errors.join("; ")
        )
    }

    /// Listing for one filter set, cached for the cache's default TTL.
    async fn products_for(&self, product_name: &str, region: &str) -> Result<Vec<Product>> {
        let cache_key = format!("{}|{}", product_name, region);
        if let Some(products) = self.cache.get::<Vec<Product>>(&cache_key).await? {
            return Ok(products);
        }

        let filters = ProductFilters {
            product_name: Some(product_name.to_string()),
            region: Some(region.to_string()),
        };
        let products = self
            .provider
            .list_products(&filters)
            .await
            .with_context(|| format!("product listing failed for {}", cache_key))?;

        self.cache.set(&cache_key, &products).await?;
        Ok(products)
    }
}

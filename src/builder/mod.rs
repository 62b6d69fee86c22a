//! Cache builder: streams the upstream catalog into a target slot.
//!
//! A build is one-shot and all-or-nothing at the slot level: schema and
//! index creation failures abort it, row-level integrity problems are
//! skipped and counted. On success the target slot is promoted to `ready`
//! and the previously serving slot demoted; on failure the target slot is
//! reset to `empty` and the serving slot is left untouched, so rebuilds
//! are always safe to retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::domain::catalog::{CatalogSource, ProductSource, RelationSource};
use crate::domain::types::{PriceTuple, VisibilityTuple};
use crate::error::EngineError;
use crate::infra::db::{SQLITE_BIND_LIMIT, map_sqlx_error};
use crate::infra::schema::{
    self, LogicalTable, PRICE_FIELDS, RELATION_COLUMNS, VISIBILITY_FIELDS, table_name_for,
};
use crate::state::{SlotId, SlotStore};

/// Counters from one completed build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub products_written: u64,
    pub products_skipped_no_price: u64,
    pub relations_written: u64,
    pub relations_skipped: u64,
    pub categories_materialized: u64,
    pub category_assignments_skipped: u64,
    pub elapsed_ms: u64,
}

/// Result of a rebuild trigger.
#[derive(Debug, Clone)]
pub enum RebuildOutcome {
    /// A slot was claimed, built and promoted.
    Completed { slot: SlotId, report: BuildReport },
    /// No slot was eligible: a build is already in flight, or the slot
    /// store is not installed.
    NotEligible,
}

/// Rebuilds cache slots from a [`CatalogSource`].
pub struct CacheBuilder {
    pool: SqlitePool,
    config: Arc<EngineConfig>,
    source: Arc<dyn CatalogSource>,
    slots: SlotStore,
}

impl CacheBuilder {
    pub fn new(
        pool: SqlitePool,
        config: Arc<EngineConfig>,
        source: Arc<dyn CatalogSource>,
        slots: SlotStore,
    ) -> Self {
        crate::infra::telemetry::describe_metrics();
        Self {
            pool,
            config,
            source,
            slots,
        }
    }

    /// Operator/scheduler entry point. Claims the next slot to warm (a
    /// compare-and-set transition, so concurrent triggers cannot collide)
    /// and runs a full build on it. Exit is a promoted slot or a logged
    /// failure with the slot reset, never a partial state.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<RebuildOutcome, EngineError> {
        let Some(slot) = self.slots.begin_warming().await? else {
            info!("rebuild skipped: no slot eligible for warming");
            return Ok(RebuildOutcome::NotEligible);
        };

        match self.build(slot).await {
            Ok(report) => {
                self.slots.mark_ready(slot).await?;
                info!(
                    slot = %slot,
                    products = report.products_written,
                    skipped_no_price = report.products_skipped_no_price,
                    relations = report.relations_written,
                    categories = report.categories_materialized,
                    elapsed_ms = report.elapsed_ms,
                    "cache build completed"
                );
                Ok(RebuildOutcome::Completed { slot, report })
            }
            Err(err) => {
                counter!("scaffale_build_failed_total").increment(1);
                warn!(slot = %slot, error = %err, "cache build failed, resetting slot");
                if let Err(reset_err) = self.slots.mark_failed(slot).await {
                    warn!(slot = %slot, error = %reset_err, "failed to reset slot after build failure");
                }
                Err(err)
            }
        }
    }

    /// Run all build phases against `slot`. The caller owns the state
    /// transitions around it.
    #[tracing::instrument(skip(self))]
    pub async fn build(&self, slot: SlotId) -> Result<BuildReport, EngineError> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let mut report = BuildReport::default();

        self.recreate_tables(slot).await?;
        self.load_relations(slot, &mut report).await?;
        let membership = self.load_products(slot, now, &mut report).await?;
        self.materialize_memberships(slot, membership, &mut report)
            .await?;
        self.write_id_lookup(slot).await?;
        self.create_indexes(slot).await?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("scaffale_build_duration_ms").record(report.elapsed_ms as f64);
        counter!("scaffale_build_products_total").increment(report.products_written);
        counter!("scaffale_build_products_skipped_total")
            .increment(report.products_skipped_no_price);
        counter!("scaffale_build_relations_total").increment(report.relations_written);
        counter!("scaffale_build_relations_skipped_total").increment(report.relations_skipped);
        Ok(report)
    }

    async fn recreate_tables(&self, slot: SlotId) -> Result<(), EngineError> {
        schema::drop_slot_tables(&self.pool, slot).await?;
        for ddl in [
            schema::product_table_ddl(slot, &self.config),
            schema::relation_table_ddl(slot),
            schema::id_lookup_table_ddl(slot),
        ] {
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn load_relations(
        &self,
        slot: SlotId,
        report: &mut BuildReport,
    ) -> Result<(), EngineError> {
        let chunk_rows = effective_chunk(self.config.insert_chunk_rows, RELATION_COLUMNS.len());
        let mut buffer: Vec<RelationSource> = Vec::with_capacity(chunk_rows);
        let mut stream = self.source.stream_relations();

        while let Some(relation) = stream.next().await {
            let relation = relation?;
            if !relation_is_sound(&relation) {
                report.relations_skipped += 1;
                continue;
            }
            buffer.push(relation);
            if buffer.len() >= chunk_rows {
                self.flush_relations(slot, &mut buffer, report).await?;
            }
        }
        self.flush_relations(slot, &mut buffer, report).await
    }

    async fn flush_relations(
        &self,
        slot: SlotId,
        buffer: &mut Vec<RelationSource>,
        report: &mut BuildReport,
    ) -> Result<(), EngineError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            table_name_for(slot, LogicalTable::Relations),
            RELATION_COLUMNS.join(", ")
        ));
        qb.push_values(buffer.drain(..), |mut b, rel| {
            b.push_bind(rel.master_id)
                .push_bind(rel.slave_id)
                .push_bind(rel.relation_type_id)
                .push_bind(rel.priority)
                .push_bind(rel.quantity)
                .push_bind(rel.hidden)
                .push_bind(rel.systemic)
                .push_bind(rel.discount_percent)
                .push_bind(rel.master_price_share);
        });
        let written = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        report.relations_written += written;
        Ok(())
    }

    async fn load_products(
        &self,
        slot: SlotId,
        now: OffsetDateTime,
        report: &mut BuildReport,
    ) -> Result<HashMap<i64, HashSet<i64>>, EngineError> {
        let valid_lists: HashSet<i64> = self
            .config
            .valid_price_lists(now)
            .iter()
            .map(|list| list.id)
            .collect();
        let chunk_rows = effective_chunk(
            self.config.insert_chunk_rows,
            schema::product_column_count(&self.config),
        );

        let mut membership: HashMap<i64, HashSet<i64>> = HashMap::new();
        let mut ancestors_memo: HashMap<i64, Option<Vec<i64>>> = HashMap::new();
        let mut buffer: Vec<ProductSource> = Vec::with_capacity(chunk_rows);
        let mut stream = self.source.stream_products();

        while let Some(product) = stream.next().await {
            let mut product = product?;

            // Rows exist only for products with at least one resolved price
            // in an active, date-valid price list.
            product.prices.retain(|list_id, _| valid_lists.contains(list_id));
            if product.prices.is_empty() {
                report.products_skipped_no_price += 1;
                continue;
            }

            for category_id in product.category_ids.clone() {
                let chain = match ancestors_memo.get(&category_id) {
                    Some(chain) => chain.clone(),
                    None => {
                        let resolved = self.resolve_ancestors(category_id, report).await?;
                        ancestors_memo.insert(category_id, resolved.clone());
                        resolved
                    }
                };
                if let Some(chain) = chain {
                    for ancestor in chain {
                        membership.entry(ancestor).or_default().insert(product.id);
                    }
                }
            }

            buffer.push(product);
            if buffer.len() >= chunk_rows {
                self.flush_products(slot, &mut buffer, report).await?;
            }
        }
        self.flush_products(slot, &mut buffer, report).await?;
        Ok(membership)
    }

    /// Resolve a category's ancestor chain. An unknown category is a
    /// row-level integrity problem: the assignment is skipped and counted,
    /// the build continues.
    async fn resolve_ancestors(
        &self,
        category_id: i64,
        report: &mut BuildReport,
    ) -> Result<Option<Vec<i64>>, EngineError> {
        use crate::domain::catalog::CatalogError;
        match self.source.category_ancestors(category_id).await {
            Ok(chain) => Ok(Some(chain)),
            Err(CatalogError::UnknownCategory { category_id }) => {
                warn!(category_id, "skipping assignment to unresolved category");
                report.category_assignments_skipped += 1;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn flush_products(
        &self,
        slot: SlotId,
        buffer: &mut Vec<ProductSource>,
        report: &mut BuildReport,
    ) -> Result<(), EngineError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut columns = vec![
            "product_id".to_string(),
            "product_external".to_string(),
            "producer_id".to_string(),
            "display_amount_id".to_string(),
            "sold_out".to_string(),
            "display_delivery_id".to_string(),
            "name".to_string(),
            "code".to_string(),
            "code2".to_string(),
            "external_code".to_string(),
            "barcode".to_string(),
            "attribute_values".to_string(),
        ];
        for ct in &self.config.category_types {
            columns.push(schema::category_type_column(ct.id));
        }
        for list in &self.config.visibility_lists {
            for field in VISIBILITY_FIELDS {
                columns.push(schema::visibility_column(list.id, field));
            }
        }
        for list in &self.config.price_lists {
            for field in PRICE_FIELDS {
                columns.push(schema::price_column(list.id, field));
            }
        }

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            table_name_for(slot, LogicalTable::Products),
            columns.join(", ")
        ));
        let config = &self.config;
        qb.push_values(buffer.drain(..), |mut b, product| {
            let attribute_values = serde_json::to_string(&product.attribute_value_ids)
                .unwrap_or_else(|_| "[]".to_string());
            let sold_out = product
                .display_amount
                .map(|bucket| bucket.amount <= 0.0)
                .unwrap_or(false);
            b.push_bind(product.id)
                .push_bind(product.external_id.to_string())
                .push_bind(product.producer_id)
                .push_bind(product.display_amount.map(|bucket| bucket.id))
                .push_bind(sold_out)
                .push_bind(product.display_delivery_id)
                .push_bind(product.name)
                .push_bind(product.code)
                .push_bind(product.code2)
                .push_bind(product.external_code)
                .push_bind(product.barcode)
                .push_bind(attribute_values);
            for ct in &config.category_types {
                b.push_bind(product.primary_categories.get(&ct.id).copied());
            }
            for list in &config.visibility_lists {
                let entry: Option<&VisibilityTuple> = product.visibility.get(&list.id);
                b.push_bind(entry.map(|v| v.hidden))
                    .push_bind(entry.map(|v| v.hidden_in_menu))
                    .push_bind(entry.map(|v| v.priority))
                    .push_bind(entry.map(|v| v.unavailable))
                    .push_bind(entry.map(|v| v.recommended));
            }
            for list in &config.price_lists {
                let entry: Option<&PriceTuple> = product.prices.get(&list.id);
                b.push_bind(entry.map(|p| p.price))
                    .push_bind(entry.map(|p| p.price_with_tax))
                    .push_bind(entry.and_then(|p| p.price_before_discount))
                    .push_bind(entry.and_then(|p| p.price_with_tax_before_discount));
            }
        });
        let written = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        report.products_written += written;
        Ok(())
    }

    async fn materialize_memberships(
        &self,
        slot: SlotId,
        membership: HashMap<i64, HashSet<i64>>,
        report: &mut BuildReport,
    ) -> Result<(), EngineError> {
        let chunk_rows = effective_chunk(self.config.insert_chunk_rows, 1);
        for (category_id, product_ids) in membership {
            sqlx::query(&schema::category_members_table_ddl(slot, category_id))
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            let table = table_name_for(slot, LogicalTable::CategoryMembers(category_id));
            let mut product_ids: Vec<i64> = product_ids.into_iter().collect();
            product_ids.sort_unstable();
            for chunk in product_ids.chunks(chunk_rows) {
                let mut qb: QueryBuilder<'_, Sqlite> =
                    QueryBuilder::new(format!("INSERT INTO {table} (product_id) "));
                qb.push_values(chunk, |mut b, id| {
                    b.push_bind(id);
                });
                qb.build()
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
            }
            report.categories_materialized += 1;
        }
        Ok(())
    }

    async fn write_id_lookup(&self, slot: SlotId) -> Result<(), EngineError> {
        let refs = self.source.entity_refs().await?;
        let table = table_name_for(slot, LogicalTable::IdLookup);
        let chunk_rows = effective_chunk(self.config.insert_chunk_rows, 3);
        for chunk in refs.chunks(chunk_rows) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "INSERT OR REPLACE INTO {table} (kind, internal_id, external_id) "
            ));
            qb.push_values(chunk, |mut b, entity| {
                b.push_bind(entity.kind.as_str())
                    .push_bind(entity.id)
                    .push_bind(entity.external_id.to_string());
            });
            qb.build()
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    /// Index creation failures are fatal to the build; a unique-index
    /// violation here means duplicate natural keys in the source.
    async fn create_indexes(&self, slot: SlotId) -> Result<(), EngineError> {
        let mut statements = schema::product_index_ddl(slot, &self.config);
        statements.extend(schema::relation_index_ddl(slot));
        for ddl in statements {
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

fn relation_is_sound(relation: &RelationSource) -> bool {
    relation.master_id > 0
        && relation.slave_id > 0
        && relation.relation_type_id > 0
        && relation.master_id != relation.slave_id
}

/// Rows per bulk insert: the configured bound, capped so one statement
/// stays within the bind-parameter budget.
fn effective_chunk(configured: usize, columns: usize) -> usize {
    configured.min(SQLITE_BIND_LIMIT / columns.max(1)).max(1)
}

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use warden_core::{EntityStore, Operation, PreferenceStore, SideEffectClass};
use warden_governance::{
    CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, HandlerOutcome, StepContext,
};

const DEFAULT_QUERY_LIMIT: usize = 50;

/// The built-in capabilities plus the three that touch the store:
/// `query` (read), `update_preference` and `create_record` (mutate).
pub fn store_backed_registry(
    entities: Arc<dyn EntityStore>,
    preferences: Arc<dyn PreferenceStore>,
    max_wait: Duration,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::with_builtins(max_wait);
    registry.register(
        CapabilityDescriptor::new(Operation::Query, SideEffectClass::Read, "records")
            .requires(&["kind"])
            .describe("Look up records by kind and optional name substring"),
        Arc::new(QueryHandler {
            entities: Arc::clone(&entities),
        }),
    );
    registry.register(
        CapabilityDescriptor::new(Operation::UpdatePreference, SideEffectClass::Mutate, "preferences")
            .requires(&["category", "key", "value"])
            .describe("Set a preference value"),
        Arc::new(UpdatePreferenceHandler { preferences }),
    );
    registry.register(
        CapabilityDescriptor::new(Operation::CreateRecord, SideEffectClass::Mutate, "records")
            .requires(&["kind", "name"])
            .describe("Create a structured record"),
        Arc::new(CreateRecordHandler { entities }),
    );
    registry
}

struct QueryHandler {
    entities: Arc<dyn EntityStore>,
}

#[async_trait]
impl CapabilityHandler for QueryHandler {
    async fn handle(&self, params: &Value, _ctx: &StepContext) -> HandlerOutcome {
        let Some(kind) = params["kind"].as_str() else {
            return HandlerOutcome::failure("kind must be a string");
        };
        let name_contains = params.get("name_contains").and_then(|n| n.as_str());
        let limit = params
            .get("limit")
            .and_then(|l| l.as_u64())
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_QUERY_LIMIT);

        match self.entities.query_entities(kind, name_contains, limit) {
            Ok(found) => HandlerOutcome::success(json!({ "count": found.len(), "records": found })),
            Err(e) => HandlerOutcome::failure(e.to_string()),
        }
    }
}

struct UpdatePreferenceHandler {
    preferences: Arc<dyn PreferenceStore>,
}

#[async_trait]
impl CapabilityHandler for UpdatePreferenceHandler {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome {
        let (Some(category), Some(key)) = (params["category"].as_str(), params["key"].as_str()) else {
            return HandlerOutcome::failure("category and key must be strings");
        };
        let confidence = params
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        let source = format!("workflow:{}", ctx.workflow);

        match self
            .preferences
            .set_preference(category, key, &params["value"], confidence, &source)
        {
            Ok(()) => {
                info!(run_id = %ctx.run_id, category, key, "preference updated");
                HandlerOutcome::success(json!({ "category": category, "key": key }))
            }
            Err(e) => HandlerOutcome::failure(e.to_string()),
        }
    }
}

struct CreateRecordHandler {
    entities: Arc<dyn EntityStore>,
}

#[async_trait]
impl CapabilityHandler for CreateRecordHandler {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome {
        let (Some(kind), Some(name)) = (params["kind"].as_str(), params["name"].as_str()) else {
            return HandlerOutcome::failure("kind and name must be strings");
        };
        let data = params.get("data").cloned().unwrap_or(Value::Null);

        match self.entities.create_entity(kind, name, &data) {
            Ok(entity) => {
                info!(run_id = %ctx.run_id, entity_id = %entity.id, kind, "record created");
                HandlerOutcome::success(json!({ "id": entity.id, "kind": entity.kind, "name": entity.name }))
            }
            Err(e) => HandlerOutcome::failure(e.to_string()),
        }
    }
}

//! Wire encoding for outbox payloads.
//!
//! Payloads are encoded once, at write time, so the dispatcher can ship
//! them as opaque bytes. The format is the schema registry's framing: a
//! zero magic byte, the big endian schema id, then the JSON body. Each
//! event type has its own schema, registered under the value subject of
//! its outbox topic.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EncodeError;
use crate::events::{Address, DomainEvent, Menu, MenuItem, Restaurant};

/// Derives the dispatch topic for an event type.
///
/// `RestaurantMenuUpdated` becomes `outbox-restaurant-menu-updated`.
pub fn topic_for_event_type(event_type: &str) -> String {
    format!("outbox-{}", kebab_case(event_type))
}

fn kebab_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_ends_word = i > 0
                && (chars[i - 1].is_ascii_lowercase()
                    || chars[i - 1].is_ascii_digit()
                    || (i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase()));
            if prev_ends_word {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

// ------------------------------------------------------------------------
// Wire records
// ------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RestaurantCreatedRecord {
    pub id: i64,
    pub name: String,
    pub address: AddressRecord,
    pub menu: MenuRecord,
}

#[derive(Debug, Serialize)]
pub struct RestaurantDeletedRecord {
    pub restaurant_id: i64,
}

#[derive(Debug, Serialize)]
pub struct RestaurantMenuUpdatedRecord {
    pub restaurant_id: i64,
    pub menu: MenuRecord,
}

#[derive(Debug, Serialize)]
pub struct AddressRecord {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

#[derive(Debug, Serialize)]
pub struct MenuRecord {
    pub items: Vec<MenuItemRecord>,
}

#[derive(Debug, Serialize)]
pub struct MenuItemRecord {
    pub id: i64,
    pub name: String,
    /// Price as a fixed two decimal string, e.g. `"9.50"`.
    pub price: String,
}

impl From<&Restaurant> for RestaurantCreatedRecord {
    fn from(restaurant: &Restaurant) -> Self {
        RestaurantCreatedRecord {
            id: restaurant.id as i64,
            name: restaurant.name.clone(),
            address: AddressRecord::from(&restaurant.address),
            menu: MenuRecord::from(&restaurant.menu),
        }
    }
}

impl From<&Address> for AddressRecord {
    fn from(address: &Address) -> Self {
        AddressRecord {
            street: address.street.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            zip: address.zip.clone(),
        }
    }
}

impl From<&Menu> for MenuRecord {
    fn from(menu: &Menu) -> Self {
        MenuRecord {
            items: menu.items.iter().map(MenuItemRecord::from).collect(),
        }
    }
}

impl From<&MenuItem> for MenuItemRecord {
    fn from(item: &MenuItem) -> Self {
        MenuItemRecord {
            id: item.id as i64,
            name: item.name.clone(),
            price: format!("{:.2}", item.price),
        }
    }
}

// ------------------------------------------------------------------------
// Schemas
// ------------------------------------------------------------------------

const MENU_DEFINITIONS: &str = r#""definitions": {
    "menu": {
      "type": "object",
      "properties": {
        "items": {
          "type": "array",
          "items": {
            "type": "object",
            "properties": {
              "id": { "type": "integer" },
              "name": { "type": "string" },
              "price": { "type": "string" }
            },
            "required": ["id", "name", "price"]
          }
        }
      },
      "required": ["items"]
    }
  }"#;

fn restaurant_created_schema() -> String {
    format!(
        r##"{{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "RestaurantCreated",
  "type": "object",
  "properties": {{
    "id": {{ "type": "integer" }},
    "name": {{ "type": "string" }},
    "address": {{
      "type": "object",
      "properties": {{
        "street": {{ "type": "string" }},
        "city": {{ "type": "string" }},
        "state": {{ "type": "string" }},
        "zip": {{ "type": "string" }}
      }},
      "required": ["street", "city", "state", "zip"]
    }},
    "menu": {{ "$ref": "#/definitions/menu" }}
  }},
  "required": ["id", "name", "address", "menu"],
  {MENU_DEFINITIONS}
}}"##
    )
}

fn restaurant_deleted_schema() -> String {
    r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "RestaurantDeleted",
  "type": "object",
  "properties": {
    "restaurant_id": { "type": "integer" }
  },
  "required": ["restaurant_id"]
}"#
    .to_string()
}

fn restaurant_menu_updated_schema() -> String {
    format!(
        r##"{{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "RestaurantMenuUpdated",
  "type": "object",
  "properties": {{
    "restaurant_id": {{ "type": "integer" }},
    "menu": {{ "$ref": "#/definitions/menu" }}
  }},
  "required": ["restaurant_id", "menu"],
  {MENU_DEFINITIONS}
}}"##
    )
}

// ------------------------------------------------------------------------
// Schema registry
// ------------------------------------------------------------------------

/// Resolves schema ids for subjects, registering the schema on first use.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn schema_id(&self, subject: &str, schema: &str) -> Result<u32, EncodeError>;
}

#[derive(Deserialize)]
struct RegisteredSchema {
    id: u32,
}

/// Schema registry client over the registry's REST API.
///
/// Ids are cached per subject, so the registry is hit once per event type
/// per process.
pub struct HttpSchemaRegistry {
    base_url: String,
    http: reqwest::Client,
    ids: Mutex<HashMap<String, u32>>,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpSchemaRegistry {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            ids: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn schema_id(&self, subject: &str, schema: &str) -> Result<u32, EncodeError> {
        if let Some(id) = self.ids.lock().await.get(subject) {
            return Ok(*id);
        }

        // Registering an already known schema returns the existing id.
        let url = format!(
            "{}/subjects/{}/versions",
            self.base_url.trim_end_matches('/'),
            subject
        );
        let body = serde_json::json!({ "schema": schema, "schemaType": "JSON" });
        let response = self.http.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EncodeError::Rejected {
                subject: subject.to_string(),
                status,
            });
        }

        let registered: RegisteredSchema = response.json().await?;
        self.ids
            .lock()
            .await
            .insert(subject.to_string(), registered.id);

        Ok(registered.id)
    }
}

/// Resolves every subject to one fixed id without touching the network.
/// Meant for tests; production code goes through [`HttpSchemaRegistry`].
#[derive(Debug, Clone)]
pub struct StaticSchemaRegistry {
    id: u32,
}

impl StaticSchemaRegistry {
    pub fn new(id: u32) -> Self {
        StaticSchemaRegistry { id }
    }
}

#[async_trait]
impl SchemaRegistry for StaticSchemaRegistry {
    async fn schema_id(&self, _subject: &str, _schema: &str) -> Result<u32, EncodeError> {
        Ok(self.id)
    }
}

// ------------------------------------------------------------------------
// Encoder
// ------------------------------------------------------------------------

/// Encodes domain events into registry framed payloads.
pub struct EventEncoder<R: SchemaRegistry> {
    registry: R,
}

impl<R: SchemaRegistry> EventEncoder<R> {
    pub fn new(registry: R) -> Self {
        EventEncoder { registry }
    }

    /// Encodes `event` under the value subject of its outbox topic.
    pub async fn encode(&self, event: &DomainEvent) -> Result<Vec<u8>, EncodeError> {
        let topic = topic_for_event_type(event.event_type());
        let subject = format!("{topic}-value");

        let (schema, body) = match event {
            DomainEvent::RestaurantCreated(restaurant) => (
                restaurant_created_schema(),
                serde_json::to_vec(&RestaurantCreatedRecord::from(restaurant))?,
            ),
            DomainEvent::RestaurantDeleted { restaurant_id } => (
                restaurant_deleted_schema(),
                serde_json::to_vec(&RestaurantDeletedRecord {
                    restaurant_id: *restaurant_id as i64,
                })?,
            ),
            DomainEvent::RestaurantMenuUpdated {
                restaurant_id,
                menu,
            } => (
                restaurant_menu_updated_schema(),
                serde_json::to_vec(&RestaurantMenuUpdatedRecord {
                    restaurant_id: *restaurant_id as i64,
                    menu: MenuRecord::from(menu),
                })?,
            ),
        };

        let schema_id = self.registry.schema_id(&subject, &schema).await?;
        Ok(frame(schema_id, &body))
    }
}

fn frame(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(1 + 4 + body.len());
    framed.push(0u8);
    framed.extend_from_slice(&schema_id.to_be_bytes());
    framed.extend_from_slice(body);
    framed
}

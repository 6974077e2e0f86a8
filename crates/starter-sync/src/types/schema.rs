//! JSON shape of entities as served by the indexer:
//!
//! ```json
//! {
//!   "entityId": "0x…",
//!   "models": { "dojo_starter": { "Moves": { "player": "0x…", "remaining": 10, … } } }
//! }
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Component, ComponentName, DirectionsAvailable, EntityId, EntityRecord, GameState, Moves,
    Position, NAMESPACE,
};
use crate::client::error::{Error, ParseError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEntity {
    pub entity_id: String,
    #[serde(default)]
    pub models: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ParsedEntity {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json).map_err(ParseError::Json)?)
    }
}

impl TryFrom<ParsedEntity> for EntityRecord {
    type Error = Error;

    fn try_from(value: ParsedEntity) -> Result<Self, Self::Error> {
        let id = EntityId::from_str(&value.entity_id).map_err(ParseError::FeltFromStr)?;
        let mut record = EntityRecord::new(id);

        for (namespace, models) in value.models {
            for (name, model) in models {
                let tag = format!("{namespace}-{name}");
                let component = ComponentName::from_tag(&tag).ok_or(Error::UnknownModel(tag))?;
                record.insert(parse_component(component, model)?);
            }
        }

        Ok(record)
    }
}

impl From<&EntityRecord> for ParsedEntity {
    fn from(record: &EntityRecord) -> Self {
        let models = record
            .components()
            .map(|component| {
                let value = match component {
                    Component::Moves(m) => serde_json::to_value(m),
                    Component::Position(p) => serde_json::to_value(p),
                    Component::GameState(g) => serde_json::to_value(g),
                    Component::DirectionsAvailable(d) => serde_json::to_value(d),
                }
                .unwrap_or(Value::Null);
                (component.name().to_string(), value)
            })
            .collect::<BTreeMap<_, _>>();

        let models = if models.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([(NAMESPACE.to_string(), models)])
        };

        Self { entity_id: record.id.to_string(), models }
    }
}

fn parse_component(name: ComponentName, value: Value) -> Result<Component, Error> {
    let component = match name {
        ComponentName::Moves => {
            Component::from(serde_json::from_value::<Moves>(value).map_err(ParseError::Json)?)
        }
        ComponentName::Position => {
            Component::from(serde_json::from_value::<Position>(value).map_err(ParseError::Json)?)
        }
        ComponentName::GameState => {
            Component::from(serde_json::from_value::<GameState>(value).map_err(ParseError::Json)?)
        }
        ComponentName::DirectionsAvailable => Component::from(
            serde_json::from_value::<DirectionsAvailable>(value).map_err(ParseError::Json)?,
        ),
    };

    Ok(component)
}

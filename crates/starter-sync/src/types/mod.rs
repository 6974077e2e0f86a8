use core::fmt;
use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use starknet_types_core::felt::Felt;
use starknet_types_core::felt::FromStrError;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, FromRepr};

use crate::utils::derive_entity_id;

pub mod filter;
pub mod schema;

/// Namespace under which every model of the starter World is registered.
pub const NAMESPACE: &str = "dojo_starter";

/// Identifier of an entity, the poseidon hash of its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Felt);

impl EntityId {
    /// Derives the id of the entity owning `keys`. See [`derive_entity_id`].
    pub fn from_keys(keys: &[Felt]) -> Self {
        derive_entity_id(keys)
    }

    pub fn felt(&self) -> Felt {
        self.0
    }
}

impl From<Felt> for EntityId {
    fn from(value: Felt) -> Self {
        Self(value)
    }
}

impl FromStr for EntityId {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Felt::from_hex(s).map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_fixed_hex_string())
    }
}

/// Identifier of an optimistic action issued through the dispatcher.
///
/// Only the dispatcher hands these out, which keeps it the sole writer of optimistic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The models of the starter World.
#[derive(
    Debug,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum ComponentName {
    Moves,
    Position,
    GameState,
    DirectionsAvailable,
}

impl ComponentName {
    pub fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    /// The fully qualified model tag, `<namespace>-<name>`.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.namespace(), self.as_ref())
    }

    /// Resolves a model from its tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let (namespace, name) = tag.split_once('-')?;
        if namespace != NAMESPACE {
            return None;
        }
        Self::from_str(name).ok()
    }

    /// Members that can be compared in a filter, nested struct members in dotted form.
    pub fn members(&self) -> &'static [&'static str] {
        match self {
            Self::Moves => &["player", "remaining", "last_direction", "can_move"],
            Self::Position => &["player", "vec.x", "vec.y"],
            Self::GameState => &["game_id", "status", "player_count", "max_players"],
            Self::DirectionsAvailable => &["player"],
        }
    }

    /// Members making up the model keys.
    pub fn key_members(&self) -> &'static [&'static str] {
        match self {
            Self::GameState => &["game_id"],
            _ => &["player"],
        }
    }
}

#[derive(
    Debug,
    Default,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
    FromRepr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(ascii_case_insensitive)]
#[repr(u8)]
pub enum Direction {
    #[default]
    None = 0,
    Left = 1,
    Right = 2,
    Up = 3,
    Down = 4,
}

#[derive(
    Debug,
    Default,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
    FromRepr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(ascii_case_insensitive)]
#[repr(u8)]
pub enum GameStatus {
    #[default]
    Lobby = 0,
    Playing = 1,
    Finished = 2,
}

// Enum members reach us either as their variant name or as their discriminant, the latter
// sometimes stringified.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Index(u8),
    Name(String),
}

macro_rules! impl_enum_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_ref())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let parsed = match EnumRepr::deserialize(deserializer)? {
                    EnumRepr::Index(index) => $ty::from_repr(index),
                    EnumRepr::Name(name) => match name.parse::<u8>() {
                        Ok(index) => $ty::from_repr(index),
                        Err(_) => $ty::from_str(&name).ok(),
                    },
                };

                parsed.ok_or_else(|| {
                    serde::de::Error::custom(concat!("invalid ", stringify!($ty), " value"))
                })
            }
        }
    };
}

impl_enum_serde!(Direction);
impl_enum_serde!(GameStatus);

impl From<Direction> for Felt {
    fn from(value: Direction) -> Self {
        Felt::from(value as u8)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Moves {
    pub player: Felt,
    pub remaining: u8,
    pub last_direction: Direction,
    pub can_move: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub player: Felt,
    pub vec: Vec2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameState {
    pub game_id: u32,
    pub status: GameStatus,
    pub player_count: u32,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectionsAvailable {
    pub player: Felt,
    pub directions: Vec<Direction>,
}

/// A single member value, as compared by filter predicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberValue {
    Felt(Felt),
    UInt(u64),
    Bool(bool),
    /// Enum members compare by variant name.
    Enum(String),
}

impl From<Felt> for MemberValue {
    fn from(value: Felt) -> Self {
        Self::Felt(value)
    }
}

impl From<u64> for MemberValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<bool> for MemberValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Direction> for MemberValue {
    fn from(value: Direction) -> Self {
        Self::Enum(value.to_string())
    }
}

impl From<GameStatus> for MemberValue {
    fn from(value: GameStatus) -> Self {
        Self::Enum(value.to_string())
    }
}

/// A model value attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Moves(Moves),
    Position(Position),
    GameState(GameState),
    DirectionsAvailable(DirectionsAvailable),
}

impl Component {
    pub fn name(&self) -> ComponentName {
        match self {
            Self::Moves(_) => ComponentName::Moves,
            Self::Position(_) => ComponentName::Position,
            Self::GameState(_) => ComponentName::GameState,
            Self::DirectionsAvailable(_) => ComponentName::DirectionsAvailable,
        }
    }

    /// Returns the value of a scalar member, `None` if the member doesn't exist.
    pub fn member(&self, member: &str) -> Option<MemberValue> {
        let value = match (self, member) {
            (Self::Moves(m), "player") => m.player.into(),
            (Self::Moves(m), "remaining") => u64::from(m.remaining).into(),
            (Self::Moves(m), "last_direction") => m.last_direction.into(),
            (Self::Moves(m), "can_move") => m.can_move.into(),
            (Self::Position(p), "player") => p.player.into(),
            (Self::Position(p), "vec.x") => u64::from(p.vec.x).into(),
            (Self::Position(p), "vec.y") => u64::from(p.vec.y).into(),
            (Self::GameState(g), "game_id") => u64::from(g.game_id).into(),
            (Self::GameState(g), "status") => g.status.into(),
            (Self::GameState(g), "player_count") => u64::from(g.player_count).into(),
            (Self::GameState(g), "max_players") => u64::from(g.max_players).into(),
            (Self::DirectionsAvailable(d), "player") => d.player.into(),
            _ => return None,
        };

        Some(value)
    }

    pub fn as_moves(&self) -> Option<&Moves> {
        match self {
            Self::Moves(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_position(&self) -> Option<&Position> {
        match self {
            Self::Position(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_game_state(&self) -> Option<&GameState> {
        match self {
            Self::GameState(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_directions_available(&self) -> Option<&DirectionsAvailable> {
        match self {
            Self::DirectionsAvailable(d) => Some(d),
            _ => None,
        }
    }
}

impl From<Moves> for Component {
    fn from(value: Moves) -> Self {
        Self::Moves(value)
    }
}

impl From<Position> for Component {
    fn from(value: Position) -> Self {
        Self::Position(value)
    }
}

impl From<GameState> for Component {
    fn from(value: GameState) -> Self {
        Self::GameState(value)
    }
}

impl From<DirectionsAvailable> for Component {
    fn from(value: DirectionsAvailable) -> Self {
        Self::DirectionsAvailable(value)
    }
}

/// An entity and the subset of its components that is known.
///
/// Components are keyed by their name so an entity never holds two values for the same model. A
/// missing component means the value is not known yet, not that it is zeroed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    components: BTreeMap<ComponentName, Component>,
}

impl EntityRecord {
    pub fn new(id: EntityId) -> Self {
        Self { id, components: BTreeMap::new() }
    }

    pub fn from_components(id: EntityId, components: impl IntoIterator<Item = Component>) -> Self {
        let mut record = Self::new(id);
        record.extend(components);
        record
    }

    /// Builder flavour of [`EntityRecord::insert`].
    pub fn with(mut self, component: impl Into<Component>) -> Self {
        self.insert(component);
        self
    }

    /// Sets a component, returning the value it replaced.
    pub fn insert(&mut self, component: impl Into<Component>) -> Option<Component> {
        let component = component.into();
        self.components.insert(component.name(), component)
    }

    pub fn remove(&mut self, name: ComponentName) -> Option<Component> {
        self.components.remove(&name)
    }

    pub fn get(&self, name: ComponentName) -> Option<&Component> {
        self.components.get(&name)
    }

    pub fn contains(&self, name: ComponentName) -> bool {
        self.components.contains_key(&name)
    }

    pub fn names(&self) -> impl Iterator<Item = ComponentName> + '_ {
        self.components.keys().copied()
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn into_components(self) -> impl Iterator<Item = Component> {
        self.components.into_values()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn moves(&self) -> Option<&Moves> {
        self.get(ComponentName::Moves).and_then(Component::as_moves)
    }

    pub fn position(&self) -> Option<&Position> {
        self.get(ComponentName::Position).and_then(Component::as_position)
    }

    pub fn game_state(&self) -> Option<&GameState> {
        self.get(ComponentName::GameState).and_then(Component::as_game_state)
    }

    pub fn directions_available(&self) -> Option<&DirectionsAvailable> {
        self.get(ComponentName::DirectionsAvailable).and_then(Component::as_directions_available)
    }
}

impl Extend<Component> for EntityRecord {
    fn extend<T: IntoIterator<Item = Component>>(&mut self, iter: T) {
        for component in iter {
            self.insert(component);
        }
    }
}

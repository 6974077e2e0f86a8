use core::fmt;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter, FromRepr};

use super::{ComponentName, EntityRecord, MemberValue, NAMESPACE};
use crate::client::error::Error;

#[derive(
    Debug, AsRefStr, Serialize, Deserialize, EnumIter, FromRepr, PartialEq, Hash, Eq, Clone, Copy,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ComparisonOperator {
    Eq,
    Neq,
    /// Exact match on a key member.
    Is,
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOperator::Eq => write!(f, "="),
            ComparisonOperator::Neq => write!(f, "!="),
            ComparisonOperator::Is => write!(f, "IS"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Hash, Eq, Clone)]
pub struct MemberClause {
    pub model: ComponentName,
    pub member: String,
    pub operator: ComparisonOperator,
    pub value: MemberValue,
}

impl MemberClause {
    fn holds(&self, record: &EntityRecord) -> bool {
        let Some(actual) = record.get(self.model).and_then(|c| c.member(&self.member)) else {
            return false;
        };

        match self.operator {
            ComparisonOperator::Eq | ComparisonOperator::Is => actual == self.value,
            ComparisonOperator::Neq => actual != self.value,
        }
    }
}

/// Selects which entities, and which of their components, a query or a subscription targets.
///
/// Clauses are grouped by model: a component is selected when every clause on its model holds.
/// Models listed in `models` are selected without conditions. A filter with neither clauses nor
/// models selects every component of the namespace.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct SubscriptionFilter {
    pub namespace: String,
    pub predicates: Vec<MemberClause>,
    pub models: BTreeSet<ComponentName>,
}

impl SubscriptionFilter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), predicates: Vec::new(), models: BTreeSet::new() }
    }

    /// Adds a clause on a member of `model`.
    pub fn member(
        mut self,
        model: ComponentName,
        member: impl Into<String>,
        operator: ComparisonOperator,
        value: impl Into<MemberValue>,
    ) -> Self {
        self.predicates.push(MemberClause {
            model,
            member: member.into(),
            operator,
            value: value.into(),
        });
        self
    }

    /// Selects every instance of `model`.
    pub fn model(mut self, model: ComponentName) -> Self {
        self.models.insert(model);
        self
    }

    /// Checks that the namespace is the one of the World models, that every clause targets an
    /// existing member, and that `Is` only targets keys.
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace != NAMESPACE {
            return Err(Error::InvalidFilter(format!("unknown namespace `{}`", self.namespace)));
        }

        for clause in &self.predicates {
            if !clause.model.members().contains(&clause.member.as_str()) {
                return Err(Error::InvalidFilter(format!(
                    "{} has no member `{}`",
                    clause.model.tag(),
                    clause.member
                )));
            }

            if clause.operator == ComparisonOperator::Is
                && !clause.model.key_members().contains(&clause.member.as_str())
            {
                return Err(Error::InvalidFilter(format!(
                    "`{}` of {} is not a key member",
                    clause.member,
                    clause.model.tag()
                )));
            }
        }

        Ok(())
    }

    fn selects_all(&self) -> bool {
        self.predicates.is_empty() && self.models.is_empty()
    }

    /// Whether the component `model` of `record` is selected.
    pub fn selects(&self, record: &EntityRecord, model: ComponentName) -> bool {
        if model.namespace() != self.namespace || !record.contains(model) {
            return false;
        }

        if self.selects_all() || self.models.contains(&model) {
            return true;
        }

        let mut clauses = self.predicates.iter().filter(|c| c.model == model).peekable();
        clauses.peek().is_some() && clauses.all(|c| c.holds(record))
    }

    /// Restricts `record` to its selected components, `None` if none is selected.
    pub fn apply(&self, record: EntityRecord) -> Option<EntityRecord> {
        if self.namespace != NAMESPACE {
            return None;
        }

        let selected: Vec<ComponentName> =
            record.names().filter(|name| self.selects(&record, *name)).collect();

        if selected.is_empty() {
            return None;
        }

        let id = record.id;
        let components = record.into_components().filter(|c| selected.contains(&c.name()));
        Some(EntityRecord::from_components(id, components))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::types::{Direction, EntityId, Felt, GameState, GameStatus, Moves, Position, Vec2};

    fn player_record(player: Felt, remaining: u8) -> EntityRecord {
        EntityRecord::new(EntityId::from_keys(&[player]))
            .with(Moves { player, remaining, last_direction: Direction::None, can_move: true })
            .with(Position { player, vec: Vec2 { x: 10, y: 10 } })
    }

    #[test]
    fn restricts_to_selected_models() {
        let player = Felt::from(0x42_u64);
        let filter = SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::Moves,
            "player",
            ComparisonOperator::Is,
            player,
        );

        let applied = filter.apply(player_record(player, 10)).expect("moves selected");
        assert!(applied.moves().is_some());
        assert!(applied.position().is_none());

        assert!(filter.apply(player_record(Felt::from(0x43_u64), 10)).is_none());
    }

    #[test]
    fn clauses_on_same_model_are_conjunctive() {
        let player = Felt::from(0x42_u64);
        let filter = SubscriptionFilter::new(NAMESPACE)
            .member(ComponentName::Moves, "player", ComparisonOperator::Is, player)
            .member(ComponentName::Moves, "remaining", ComparisonOperator::Neq, 0_u64);

        assert!(filter.apply(player_record(player, 3)).is_some());
        assert!(filter.apply(player_record(player, 0)).is_none());
    }

    #[test]
    fn unconditional_models_and_empty_filter() {
        let player = Felt::from(0x42_u64);
        let game = EntityRecord::new(EntityId::from_keys(&[Felt::ONE])).with(GameState {
            game_id: 1,
            status: GameStatus::Lobby,
            player_count: 0,
            max_players: 4,
        });

        let games = SubscriptionFilter::new(NAMESPACE).model(ComponentName::GameState);
        assert!(games.apply(game.clone()).is_some());
        assert!(games.apply(player_record(player, 1)).is_none());

        let everything = SubscriptionFilter::new(NAMESPACE);
        assert_eq!(everything.apply(player_record(player, 1)).map(|r| r.len()), Some(2));

        let foreign = SubscriptionFilter::new("other_namespace");
        assert!(foreign.apply(game).is_none());
    }

    #[test]
    fn validation() {
        let unknown_member = SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::Position,
            "z",
            ComparisonOperator::Eq,
            1_u64,
        );
        assert_matches!(unknown_member.validate(), Err(Error::InvalidFilter(_)));

        let is_on_value = SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::Moves,
            "remaining",
            ComparisonOperator::Is,
            1_u64,
        );
        assert_matches!(is_on_value.validate(), Err(Error::InvalidFilter(_)));

        let valid = SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::GameState,
            "game_id",
            ComparisonOperator::Is,
            1_u64,
        );
        assert_matches!(valid.validate(), Ok(()));

        let foreign = SubscriptionFilter::new("pac_royale").model(ComponentName::Moves);
        assert_matches!(foreign.validate(), Err(Error::InvalidFilter(_)));
    }
}

//! Stateful property testing for the normalized record store.
//!
//! Uses proptest-state-machine to check that primary maps, the users-by-name
//! lookup and the invalid set stay consistent across arbitrary sequences of
//! upserts, renames, deletions and invalidations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};

use tether_api::records::User;
use tether_api::{DataUpdate, RecordId, Resource, ResourceName, Store};

/// Operations applied to the store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Store a full user record.
    Upsert { id: i64, name: String },
    /// Store several users in one update.
    UpsertMany { users: Vec<(i64, String)> },
    /// Remove a user.
    Delete { id: i64 },
    /// Mark a user invalid.
    Invalidate { id: i64 },
}

/// Reference model of the users part of the cache.
#[derive(Clone, Debug, Default)]
pub struct StoreModel {
    /// Stored users and their names.
    pub users: BTreeMap<i64, String>,
    /// Name → owning id, last writer wins.
    pub by_name: BTreeMap<String, i64>,
    /// Ids marked invalid and not refetched since.
    pub invalid: BTreeSet<i64>,
    /// Number of non-empty updates dispatched.
    pub dispatched: usize,
}

impl StoreModel {
    fn upsert(&mut self, id: i64, name: &str) {
        self.by_name.retain(|_, owner| *owner != id);
        self.by_name.insert(name.to_string(), id);
        self.users.insert(id, name.to_string());
        self.invalid.remove(&id);
    }

    fn remove(&mut self, id: i64) {
        self.by_name.retain(|_, owner| *owner != id);
        self.users.remove(&id);
    }
}

fn user(id: i64, name: &str) -> User {
    User {
        id: RecordId::Int(id),
        name: Some(name.to_string()),
        fullname: None,
        email: None,
        status: None,
    }
}

impl ReferenceStateMachine for StoreModel {
    type State = Self;
    type Transition = StoreOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let names = vec!["alice", "bob", "carol", "dave"];

        prop_oneof![
            4 => (0i64..6, proptest::sample::select(names.clone()))
                .prop_map(|(id, name)| StoreOperation::Upsert { id, name: name.to_string() }),
            1 => prop::collection::vec(
                (0i64..6, proptest::sample::select(names.clone())),
                1..4
            )
            .prop_map(|users| StoreOperation::UpsertMany {
                users: users.into_iter().map(|(id, n)| (id, n.to_string())).collect(),
            }),
            2 => (0i64..6).prop_map(|id| StoreOperation::Delete { id }),
            1 => (0i64..6).prop_map(|id| StoreOperation::Invalidate { id }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            StoreOperation::Upsert { id, name } => {
                state.upsert(*id, name);
            }
            StoreOperation::UpsertMany { users } => {
                // Lookup keys come from the last version of each id, in the
                // order those last versions appear.
                let mut seen = BTreeSet::new();
                let mut latest: Vec<(i64, &str)> = users
                    .iter()
                    .rev()
                    .filter(|(id, _)| seen.insert(*id))
                    .map(|(id, name)| (*id, name.as_str()))
                    .collect();
                latest.reverse();

                state.by_name.retain(|_, owner| !seen.contains(owner));
                for (id, name) in latest {
                    state.users.insert(id, name.to_string());
                    state.invalid.remove(&id);
                    state.by_name.insert(name.to_string(), id);
                }
            }
            StoreOperation::Delete { id } => {
                state.remove(*id);
                state.invalid.remove(id);
            }
            StoreOperation::Invalidate { id } => {
                state.remove(*id);
                state.invalid.insert(*id);
            }
        }
        state.dispatched += 1;
        state
    }

    fn preconditions(_state: &Self::State, _transition: &Self::Transition) -> bool {
        true
    }
}

/// Store under test plus a broadcast receiver counting applied updates.
pub struct StoreHarness {
    store: Arc<Store>,
    updates: tokio::sync::broadcast::Receiver<Arc<DataUpdate>>,
    received: usize,
}

impl StoreHarness {
    fn new() -> Self {
        let store = Store::with_capacity(64);
        let updates = store.subscribe();
        Self {
            store,
            updates,
            received: 0,
        }
    }

    fn apply_operation(&mut self, op: &StoreOperation) {
        let update = match op {
            StoreOperation::Upsert { id, name } => {
                let mut update = DataUpdate::default();
                update.push(user(*id, name).into_record());
                update
            }
            StoreOperation::UpsertMany { users } => {
                let mut update = DataUpdate::default();
                for (id, name) in users {
                    update.push(user(*id, name).into_record());
                }
                update
            }
            StoreOperation::Delete { id } => {
                DataUpdate::deleted(ResourceName::Users, [RecordId::Int(*id)])
            }
            StoreOperation::Invalidate { id } => {
                DataUpdate::invalidated(ResourceName::Users, [RecordId::Int(*id)])
            }
        };
        self.store.dispatch(update);

        while self.updates.try_recv().is_ok() {
            self.received += 1;
        }
    }
}

impl StateMachineTest for StoreHarness {
    type SystemUnderTest = Self;
    type Reference = StoreModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let snapshot = state.store.snapshot();

        // Primary map matches the model exactly.
        assert_eq!(snapshot.count(ResourceName::Users), ref_state.users.len());
        for (id, name) in &ref_state.users {
            let stored = snapshot
                .get::<User>(&RecordId::Int(*id))
                .expect("modelled user missing from store");
            assert_eq!(stored.name.as_deref(), Some(name.as_str()));
        }

        // Lookup agrees with the model's last-writer-wins ownership.
        for name in ["alice", "bob", "carol", "dave"] {
            let expected = ref_state.by_name.get(name).map(|id| RecordId::Int(*id));
            let actual = snapshot.user_by_name(name).map(|u| u.id.clone());
            assert_eq!(actual, expected, "users_by_name[{}]", name);
        }

        // Every secondary id resolves in its primary map.
        for (resource, id) in snapshot.secondary_ids() {
            assert!(
                snapshot.record(resource, id).is_some(),
                "dangling {} {}",
                resource,
                id
            );
        }

        let invalid: BTreeSet<RecordId> = snapshot
            .invalid_ids(ResourceName::Users)
            .cloned()
            .collect();
        let expected: BTreeSet<RecordId> = ref_state.invalid.iter().map(|id| RecordId::Int(*id)).collect();
        assert_eq!(invalid, expected);

        // Every dispatch here is non-empty, so each one is broadcast.
        assert_eq!(state.received, ref_state.dispatched);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_state_machine_test(sequential 1..50 => StoreHarness);
}

// Additional targeted tests

#[test]
fn test_rename_then_delete_clears_lookup() {
    let store = Store::new();
    let mut update = DataUpdate::default();
    update.push(user(1, "alice").into_record());
    store.dispatch(update);

    let mut rename = DataUpdate::default();
    rename.push(user(1, "alicia").into_record());
    store.dispatch(rename);

    let snapshot = store.snapshot();
    assert!(snapshot.user_by_name("alice").is_none());
    assert_eq!(snapshot.user_by_name("alicia").map(|u| u.id.clone()), Some(RecordId::Int(1)));

    store.dispatch(DataUpdate::deleted(ResourceName::Users, [RecordId::Int(1)]));
    assert!(store.snapshot().user_by_name("alicia").is_none());

    // Earlier snapshots are untouched.
    assert!(snapshot.user_by_name("alicia").is_some());
}

#[test]
fn test_lagging_subscriber_detects_loss() {
    let store = Store::with_capacity(4);
    let mut rx = store.subscribe();

    for i in 0..10 {
        let mut update = DataUpdate::default();
        update.push(user(i, &format!("user{}", i)).into_record());
        store.dispatch(update);
    }

    let mut lagged = false;
    loop {
        match rx.try_recv() {
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {
                lagged = true;
                break;
            }
            Err(_) => break,
        }
    }
    assert!(lagged, "expected broadcast channel to lag");
    assert_eq!(store.snapshot().count(ResourceName::Users), 10);
}

//! Per-event input pipeline.
//!
//! Threads one input record through the full commit sequence: parse,
//! state-input check, room locate, NID assignment and persistence,
//! pre-event snapshot computation, DAG edge maintenance, and output
//! construction. Cancellation is honored at step boundaries only, so a
//! cancelled record never leaves a step half-done.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use roomserver_events::Event;

use crate::db::{Database, DbError};
use crate::error::InputError;
use crate::input::snapshot::{self, ComputedState};
use crate::input::{InputEvent, InputKind};
use crate::metrics;
use crate::output::{self, OutputNewEvent};
use crate::telemetry::PipelineTimer;
use crate::types::{RoomNid, StateAtEvent, StateEntry, StateKeyPair};

/// Handles one input record at a time for its partition.
pub struct InputHandler {
    db: Database,
}

/// The pre-event state input resolved during the state-input check.
enum PreState {
    /// Explicit prior-state entries supplied with the record.
    Given(Vec<StateEntry>),
    /// The recorded state at each deduplicated prev_event.
    AtPrevs(Vec<StateAtEvent>),
}

impl InputHandler {
    /// Create a handler over the store.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Process one input record.
    ///
    /// Returns the output record to publish, or `None` for outliers.
    pub async fn handle(
        &self,
        input: &InputEvent,
        cancel: &CancellationToken,
    ) -> Result<Option<OutputNewEvent>, InputError> {
        let _timer = PipelineTimer::new(input.kind.as_str());

        // 1) Parse and validate the event.
        let event = Event::parse(input.event_json.get().as_bytes())?;
        self.checkpoint(cancel)?;

        // 2) Check that we have all the state needed to process it.
        let pre_state = self.prepare_state(input, &event).await?;
        self.checkpoint(cancel)?;

        // 3) Locate the room, creating it only for outliers.
        let room_nid = self.prepare_room(input.kind, event.room_id()).await?;
        self.checkpoint(cancel)?;

        // 4) Assign NIDs and persist the event.
        let event_type_nid = self
            .db
            .interner()
            .assign_event_type_nid(event.event_type())
            .await?;
        let state_key_nid = match event.state_key() {
            Some(key) => Some(self.db.interner().assign_state_key_nid(key).await?),
            None => None,
        };
        let added = self
            .db
            .events()
            .add_event(
                event.event_id(),
                room_nid,
                event.depth(),
                event_type_nid,
                state_key_nid,
                event.reference_hash(),
                event.raw(),
            )
            .await?;
        let self_entry = state_key_nid.map(|key_nid| StateEntry {
            key: StateKeyPair::new(event_type_nid, key_nid),
            event_nid: added.event_nid,
        });

        // 5) Outliers are stored for their auth value only.
        if input.kind == InputKind::Outlier {
            debug!(event_id = %event.event_id(), "Outlier stored");
            return Ok(None);
        }
        let pre_state = pre_state.ok_or_else(|| {
            DbError::Corrupt(format!(
                "no pre-event state input for non-outlier {}",
                event.event_id()
            ))
        })?;
        self.checkpoint(cancel)?;

        // 6) Compute and bind the pre-event snapshot. Once assigned, the
        // state at an event never changes; redelivered records skip the
        // computation entirely.
        let before_snapshot = match added.before_snapshot {
            Some(existing) => existing,
            None => {
                let computed = match pre_state {
                    PreState::Given(entries) => {
                        ComputedState::Full(snapshot::last_wins(entries))
                    }
                    PreState::AtPrevs(states) => {
                        snapshot::compute_pre_event_state(&self.db, event.event_id(), states)
                            .await?
                    }
                };
                let computed = self.reuse_current(room_nid, computed).await?;
                let nid = snapshot::write_computed(&self.db, room_nid, &computed).await?;
                metrics::SNAPSHOTS_WRITTEN
                    .with_label_values(&[computed.mode()])
                    .inc();
                self.db
                    .events()
                    .set_before_snapshot(added.event_nid, nid)
                    .await?;
                nid
            }
        };
        self.checkpoint(cancel)?;

        // 7) Update the room's DAG edges.
        let mut prev_ids = event.prev_event_ids().to_vec();
        prev_ids.sort();
        prev_ids.dedup();
        let rooms = self.db.rooms();
        rooms
            .record_event_refs(room_nid, added.event_nid, &prev_ids)
            .await?;
        rooms.remove_forward_edges(room_nid, &prev_ids).await?;
        if !rooms.is_referenced(room_nid, event.event_id()).await? {
            rooms.add_forward_edge(room_nid, added.event_nid).await?;
        }
        if input.kind == InputKind::Backfill {
            let found = self.db.events().found_event_ids(&prev_ids).await?;
            if found.len() < prev_ids.len() {
                rooms.add_backward_edge(room_nid, added.event_nid).await?;
            }
        }
        // This arrival may complete the ancestry of earlier backward edges.
        for referencer in rooms.referencers_of(room_nid, event.event_id()).await? {
            if referencer != added.event_nid
                && rooms.missing_prev_count(referencer).await? == 0
            {
                rooms.remove_backward_edge(room_nid, referencer).await?;
            }
        }
        self.checkpoint(cancel)?;

        // 8) Advance the room's current state and build the output record.
        let was_active = rooms.is_active(room_nid).await?;
        let reset_state = input.kind == InputKind::Join && !was_active;
        let old_current = rooms.current_snapshot(room_nid).await?;
        let new_current = match self_entry {
            Some(entry) => {
                let computed = snapshot::apply_entry(&self.db, before_snapshot, entry).await?;
                let computed = self.reuse_current(room_nid, computed).await?;
                snapshot::write_computed(&self.db, room_nid, &computed).await?
            }
            None => before_snapshot,
        };
        let output = output::build_output(
            &self.db,
            &event,
            before_snapshot,
            new_current,
            old_current,
            reset_state,
        )
        .await?;
        rooms.set_current_snapshot(room_nid, new_current).await?;
        if input.kind == InputKind::Join {
            rooms.set_active(room_nid).await?;
        }

        info!(
            event_id = %event.event_id(),
            room_id = %event.room_id(),
            kind = input.kind.as_str(),
            "Event committed"
        );
        Ok(Some(output))
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), InputError> {
        if cancel.is_cancelled() {
            Err(InputError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve the record's state input, or `None` for outliers.
    async fn prepare_state(
        &self,
        input: &InputEvent,
        event: &Event,
    ) -> Result<Option<PreState>, InputError> {
        if input.kind == InputKind::Outlier {
            return Ok(None);
        }

        if let Some(ids) = &input.state_event_ids {
            let mut unique = ids.clone();
            unique.sort();
            unique.dedup();
            let entries = self.db.events().state_events(&unique).await?;
            if entries.len() != unique.len() {
                return Err(self
                    .missing_state_error(
                        event,
                        InputError::MissingState(event.event_id().to_string()),
                    )
                    .await);
            }
            return Ok(Some(PreState::Given(entries)));
        }

        let mut prev_ids = event.prev_event_ids().to_vec();
        prev_ids.sort();
        prev_ids.dedup();
        let mut states = self.db.events().state_at_events(&prev_ids).await?;
        if states.len() != prev_ids.len() && self.root_create_outliers(&prev_ids).await? {
            states = self.db.events().state_at_events(&prev_ids).await?;
        }
        if states.len() != prev_ids.len() {
            return Err(self
                .missing_state_error(
                    event,
                    InputError::MissingPrevState(event.event_id().to_string()),
                )
                .await);
        }
        Ok(Some(PreState::AtPrevs(states)))
    }

    /// Missing state against an unknown room is a bootstrap defect, not a
    /// dependency to wait for: the ancestry can never arrive for a room
    /// whose first events were not outliers.
    async fn missing_state_error(&self, event: &Event, missing: InputError) -> InputError {
        match self.db.rooms().lookup_room_nid(event.room_id()).await {
            Ok(None) => InputError::BadRoomBootstrap(event.room_id().to_string()),
            _ => missing,
        }
    }

    /// Assign the empty state to stored create outliers among `event_ids`.
    ///
    /// A create event with no prev_events roots its room's graph; the
    /// first non-outlier referencing it pins its pre-event state to the
    /// empty snapshot so the chain can be walked from there.
    async fn root_create_outliers(&self, event_ids: &[String]) -> Result<bool, InputError> {
        let mut rooted = false;
        for (event_nid, room_nid, json) in self.db.events().unrooted_creates(event_ids).await? {
            let create = Event::parse(&json).map_err(|e| {
                DbError::Corrupt(format!("unparseable stored event {event_nid}: {e}"))
            })?;
            if !create.prev_event_ids().is_empty() {
                continue;
            }
            let empty = self.db.state().write_snapshot(room_nid, &[], &[]).await?;
            self.db.events().set_before_snapshot(event_nid, empty).await?;
            debug!(event_nid = %event_nid, "Rooted create outlier at the empty state");
            rooted = true;
        }
        Ok(rooted)
    }

    /// Locate the room, creating it only when bootstrapping via outliers.
    async fn prepare_room(&self, kind: InputKind, room_id: &str) -> Result<RoomNid, InputError> {
        if let Some(nid) = self.db.rooms().lookup_room_nid(room_id).await? {
            return Ok(nid);
        }
        if kind != InputKind::Outlier {
            return Err(InputError::BadRoomBootstrap(room_id.to_string()));
        }
        let nid = self.db.rooms().assign_room_nid(room_id).await?;
        if let Ok(count) = self.db.rooms().count().await {
            metrics::ROOMS.set(count);
        }
        info!(room_id = %room_id, "Room created");
        Ok(nid)
    }

    /// Swap a computed delta for the room's current snapshot when their
    /// compositions are identical, so successive events share one
    /// snapshot instead of writing duplicates.
    async fn reuse_current(
        &self,
        room_nid: RoomNid,
        computed: ComputedState,
    ) -> Result<ComputedState, InputError> {
        if let ComputedState::Delta { base, entries } = &computed {
            let current = self.db.rooms().current_snapshot(room_nid).await?;
            if let Some(existing) =
                snapshot::try_reuse_snapshot(&self.db, current, base, entries).await?
            {
                return Ok(ComputedState::Shared(existing));
            }
        }
        Ok(computed)
    }
}

// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use cairn_chain_exports::state_objects::{
    permission_key, GlobalPropertyObject, PermissionObject,
};
use cairn_chain_exports::{ChainError, ChainResult};
use cairn_db_exports::GLOBAL_PROPERTY_KEY;
use cairn_models::action::PermissionLevel;
use cairn_models::authority::{Authority, PermissionLevelWeight};
use cairn_models::constants::{
    ACTIVE_NAME, MAJORITY_PRODUCERS_PERMISSION_NAME, MINORITY_PRODUCERS_PERMISSION_NAME,
    PRODUCERS_ACCOUNT_NAME,
};
use cairn_models::producer::{ProducerKey, ProducerSchedule};
use cairn_protocol_features::BuiltinProtocolFeature;

impl Controller {
    /// Propose a new producer schedule from the pending block.
    ///
    /// Returns the version the schedule will have, or -1 when the proposal is ignored: a schedule
    /// proposed in an earlier block is still waiting, or the producers would not change.
    pub fn set_proposed_producers(&self, producers: Vec<ProducerKey>) -> ChainResult<i64> {
        let mut gpo = self.get_global_properties()?;
        let current_block_num = self.head.block_num() + 1;

        if producers.is_empty()
            && self.is_builtin_activated(BuiltinProtocolFeature::DisallowEmptyProducerSchedule)
        {
            return Ok(-1);
        }
        if let Some(proposed_num) = gpo.proposed_schedule_block_num {
            if proposed_num != current_block_num {
                return Ok(-1);
            }
            if gpo.proposed_schedule.producers == producers {
                return Ok(-1);
            }
        }

        let pending = self.pending_producers();
        let reference = if pending.producers.is_empty() {
            self.active_producers()
        } else {
            pending
        };
        if reference.producers == producers {
            return Ok(-1);
        }
        let schedule = ProducerSchedule {
            version: reference.version + 1,
            producers,
        };
        let version = schedule.version as i64;
        gpo.proposed_schedule_block_num = Some(current_block_num);
        gpo.proposed_schedule = schedule;
        self.with_db(|db| {
            db.put_object(GLOBAL_PROPERTY_KEY.to_vec(), &gpo)?;
            Ok(())
        })?;
        Ok(version)
    }

    /// Schedule producing the pending block, or the head block when nothing is pending
    pub fn active_producers(&self) -> ProducerSchedule {
        match &self.pending {
            Some(pending) => pending.active_schedule().clone(),
            None => self.head.header_state.active_schedule.clone(),
        }
    }

    /// Schedule waiting to become active
    pub fn pending_producers(&self) -> ProducerSchedule {
        match &self.pending {
            Some(pending) => pending.pending_schedule().clone(),
            None => self.head.header_state.pending_schedule.schedule.clone(),
        }
    }

    /// Schedule proposed by a privileged contract and not yet pending
    pub fn proposed_producers(&self) -> ChainResult<Option<ProducerSchedule>> {
        let gpo: GlobalPropertyObject = self.get_global_properties()?;
        Ok(gpo
            .proposed_schedule_block_num
            .map(|_| gpo.proposed_schedule))
    }

    /// Point the permissions of the producers account at the active producers
    pub(crate) fn update_producers_authority(&self) -> ChainResult<()> {
        let producers = self.active_producers().producers;
        let count = producers.len() as u32;
        let weights: Vec<PermissionLevelWeight> = producers
            .iter()
            .map(|producer| PermissionLevelWeight {
                permission: PermissionLevel::new(producer.producer_name, ACTIVE_NAME),
                weight: 1,
            })
            .collect();
        let now = self.pending_block_time()?;
        let updates = [
            (ACTIVE_NAME, count * 2 / 3 + 1),
            (MAJORITY_PRODUCERS_PERMISSION_NAME, count / 2 + 1),
            (MINORITY_PRODUCERS_PERMISSION_NAME, count / 3 + 1),
        ];
        self.with_db(|db| {
            for (name, threshold) in updates {
                let authority = Authority::from_permissions(threshold, weights.clone());
                let permission: PermissionObject = db
                    .get_object(&permission_key(PRODUCERS_ACCOUNT_NAME, name))?
                    .ok_or_else(|| {
                        ChainError::Misc(format!(
                            "permission {}@{} is missing",
                            PRODUCERS_ACCOUNT_NAME, name
                        ))
                    })?;
                if permission.auth != authority {
                    self.authorization
                        .modify_permission(db, permission, authority, now)?;
                }
            }
            Ok(())
        })
    }
}

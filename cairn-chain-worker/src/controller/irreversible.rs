// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use cairn_chain_exports::{BlockState, BlockStatus, ChainError, ChainResult, DbReadMode};
use std::sync::Arc;

impl Controller {
    /// Move the blocks that became irreversible from the fork database to the block log.
    ///
    /// Each block is announced and its state changes committed, then it is appended to the log
    /// and dropped from the reversible store. In irreversible mode the blocks are applied here
    /// first. The fork database root follows the last block processed, even when a later one
    /// fails.
    pub(crate) fn log_irreversible(&mut self) -> ChainResult<()> {
        let root = self.fork_db_root()?;
        let lib_num = match self.blog.head_block_num() {
            Some(num) => num,
            None => self.blog.first_block_num().saturating_sub(1),
        };
        match self.blog.head_id() {
            Some(log_head_id) if log_head_id != root.id() => {
                return Err(ChainError::ForkDatabase(
                    "fork database root does not match the block log head".to_string(),
                ))
            }
            None if root.block_num() != lib_num => {
                return Err(ChainError::ForkDatabase(format!(
                    "fork database root {} is inconsistent with the block log start {}",
                    root.block_num(),
                    lib_num + 1
                )))
            }
            _ => {}
        }

        let fork_head = if self.config.read_mode == DbReadMode::Irreversible {
            self.fork_db_pending_head()
        } else {
            self.fork_db_head()
        };
        let new_lib = fork_head.dpos_irreversible_blocknum();
        if new_lib <= lib_num {
            return Ok(());
        }

        let branch = self.fork_db.fetch_branch(&fork_head.id(), new_lib);
        let mut root_id = root.id();
        let mut result = Ok(());
        for bsp in branch.iter().rev() {
            if let Err(err) = self.make_irreversible(bsp) {
                result = Err(err);
                break;
            }
            root_id = bsp.id();
        }

        if root_id != root.id() {
            self.fork_db.advance_root(&root_id)?;
        }
        result
    }

    fn make_irreversible(&mut self, bsp: &Arc<BlockState>) -> ChainResult<()> {
        if self.config.read_mode == DbReadMode::Irreversible {
            self.apply_block(bsp, BlockStatus::Complete)?;
            self.head = bsp.clone();
            self.fork_db.mark_valid(bsp)?;
        }
        self.signals.irreversible_block.emit(bsp)?;
        self.store.write().commit(bsp.block_num() as i64);
        self.blog.append(&bsp.block)?;
        self.reversible_blocks.remove_up_to(bsp.block_num())?;
        chain_trace!("controller.irreversible_block", {
            "block_id": bsp.id(),
            "block_num": bsp.block_num()
        });
        Ok(())
    }
}

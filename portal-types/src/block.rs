use crate::instruction::Instruction;
use serde::{Deserialize, Serialize};

fn hash_concat(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

fn leaf_hash(inst: &Instruction) -> [u8; 32] {
    match bincode::serialize(inst) {
        Ok(bytes) => *blake3::hash(&bytes).as_bytes(),
        Err(_) => [0u8; 32],
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: [u8; 32],
    pub instructions_root: [u8; 32],
    pub state_root: [u8; 32],
    pub timestamp: u64,
    pub proposer: [u8; 32],
}

/// A beacon block as far as the Portal is concerned: the ordered instruction list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn instructions_root(insts: &[Instruction]) -> [u8; 32] {
        if insts.is_empty() {
            return [0u8; 32];
        }

        let mut level: Vec<[u8; 32]> = insts.iter().map(leaf_hash).collect();
        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            let mut i = 0;
            while i < level.len() {
                let left = level[i];
                let right = if i + 1 < level.len() {
                    level[i + 1]
                } else {
                    left
                };
                next.push(hash_concat(&left, &right));
                i += 2;
            }
            level = next;
        }
        level[0]
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        if let Ok(bytes) = bincode::serialize(&self.header) {
            hasher.update(&bytes);
        }
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{InstructionStatus, PortalInstruction, WithdrawRewardContent};

    fn reward_withdraw(amount: u64) -> Instruction {
        Instruction::new(
            Some(0),
            InstructionStatus::Accepted,
            PortalInstruction::WithdrawReward(WithdrawRewardContent {
                custodian: "cust".into(),
                asset: "native".into(),
                amount,
                tx_req_id: format!("tx-{amount}"),
                reason: None,
            }),
        )
    }

    #[test]
    fn root_depends_on_order() {
        let a = reward_withdraw(1);
        let b = reward_withdraw(2);
        let ab = Block::instructions_root(&[a.clone(), b.clone()]);
        let ba = Block::instructions_root(&[b, a]);
        assert_ne!(ab, ba);
        assert_eq!(Block::instructions_root(&[]), [0u8; 32]);
    }
}

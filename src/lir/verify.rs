//! Structural verification of produced functions.
//!
//! Checks that every block ends in exactly one terminator, phis lead their
//! block and name each predecessor exactly once, instruction operands are
//! placed in a block, and operands defined in the same block precede their use.
//! Cross-block dominance is not checked.

use super::*;
use crate::core::{CompileError, CompileResult};
use hashbrown::{HashMap, HashSet};

pub fn verify_function(func: &Function) -> CompileResult<()> {
    let fail = |msg: String| -> CompileResult<()> {
        Err(CompileError::internal(format!(
            "malformed function @{}: {msg}",
            func.name
        )))
    };

    let mut placed: HashMap<InstId, (BlockId, usize)> = HashMap::new();
    for &block in func.blocks() {
        for (pos, &id) in func.block(block).insts.iter().enumerate() {
            if placed.insert(id, (block, pos)).is_some() {
                return fail(format!("instruction {} placed twice", id.0));
            }
            if func.inst(id).block != block {
                return fail(format!("instruction {} has a stale block", id.0));
            }
        }
    }

    for &block in func.blocks() {
        let name = &func.block(block).name;
        let insts = &func.block(block).insts;
        let Some(&last) = insts.last() else {
            return fail(format!("block {name} is empty"));
        };
        if !func.inst(last).op.is_terminator() {
            return fail(format!("block {name} does not end in a terminator"));
        }

        let preds: HashSet<BlockId> = func.predecessors(block).into_iter().collect();
        let mut in_phis = true;
        for (pos, &id) in insts.iter().enumerate() {
            let op = &func.inst(id).op;
            if op.is_terminator() && pos + 1 != insts.len() {
                return fail(format!("terminator in the middle of block {name}"));
            }
            match op {
                Op::Phi { incoming } => {
                    if !in_phis {
                        return fail(format!("phi after non-phi in block {name}"));
                    }
                    let mut seen = HashSet::new();
                    for (_, from) in incoming {
                        if !preds.contains(from) {
                            return fail(format!(
                                "phi {} in {name} has incoming from non-predecessor {}",
                                id.0,
                                func.block(*from).name
                            ));
                        }
                        if !seen.insert(*from) {
                            return fail(format!(
                                "phi {} in {name} names {} twice",
                                id.0,
                                func.block(*from).name
                            ));
                        }
                    }
                    if seen.len() != preds.len() {
                        return fail(format!(
                            "phi {} in {name} has {} incoming edges for {} predecessors",
                            id.0,
                            seen.len(),
                            preds.len()
                        ));
                    }
                }
                _ => in_phis = false,
            }

            for operand in op.operands() {
                let Val::Inst(def) = operand else {
                    continue;
                };
                let Some(&(def_block, def_pos)) = placed.get(&def) else {
                    return fail(format!(
                        "instruction {} uses unplaced instruction {}",
                        id.0, def.0
                    ));
                };
                if func.inst(def).ty == Ty::Void {
                    return fail(format!("instruction {} uses a void value", id.0));
                }
                if !op.is_phi() && def_block == block && def_pos >= pos {
                    return fail(format!(
                        "instruction {} in {name} uses {} before its definition",
                        id.0, def.0
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Builder;

    #[test]
    fn test_well_formed_loop_passes() {
        let mut b = Builder::new(Function::new("f", vec![], Ty::Void), "entry");
        let entry = b.current_block();
        let body = b.add_block("body");
        let exit = b.add_block("exit");
        b.br(body);
        b.position_at_end(body);
        let i = b.phi(Ty::I32);
        let next = b.add_i32(i, 1);
        let ten = b.i32(10);
        let done = b.icmp(IntPredicate::Eq, next, ten);
        b.cond_br(done, exit, body);
        let zero = b.i32(0);
        b.func_mut().add_incoming(i, zero, entry).unwrap();
        b.func_mut().add_incoming(i, next, body).unwrap();
        b.position_at_end(exit);
        b.ret(None);
        assert!(verify_function(b.func()).is_ok());
    }

    #[test]
    fn test_missing_phi_edge_fails() {
        let mut b = Builder::new(Function::new("f", vec![], Ty::Void), "entry");
        let entry = b.current_block();
        let body = b.add_block("body");
        b.br(body);
        b.position_at_end(body);
        let i = b.phi(Ty::I32);
        let next = b.add_i32(i, 1);
        b.br(body);
        b.func_mut().add_incoming(i, next, body).unwrap();
        assert_eq!(b.func().predecessors(body), vec![entry, body]);
        let err = verify_function(b.func()).unwrap_err();
        assert!(err.to_string().contains("incoming edges"));
    }

    #[test]
    fn test_missing_terminator_fails() {
        let mut b = Builder::new(Function::new("f", vec![], Ty::Void), "entry");
        let exit = b.add_block("exit");
        b.br(exit);
        let err = verify_function(b.func()).unwrap_err();
        assert!(err.to_string().contains("exit is empty"));
    }
}

use crate::support::handlers::{Handler, HandlerBody, body};
use devirt_core::backend::RegisterFile;
use devirt_core::decoder::TableDecoder;
use devirt_core::detection::{Classification, classify};
use devirt_core::trace::{Node, TraceStep};
use devirt_core::{HandlerPattern, RegisterPair, VmRegisterSet};

fn occurrence(body: &HandlerBody) -> (Node, TableDecoder) {
    let steps = body
        .addresses
        .iter()
        .map(|address| TraceStep::new(*address, RegisterFile::default()))
        .collect();
    let mut decoder = TableDecoder::new();
    for instruction in &body.decoded {
        decoder.insert(instruction.clone());
    }
    (Node::new(steps), decoder)
}

#[test]
fn pop_handler_derives_the_same_pair_every_time() {
    let pop = body(Handler::Pop);
    let ir = pop.ir.as_ref().expect("pop handler lifts");
    let (node, decoder) = occurrence(&pop);
    let registers = VmRegisterSet::new();

    let first = classify(ir, &node, &registers, &decoder);
    let second = classify(ir, &node, &registers, &decoder);
    assert_eq!(first, second);

    let Classification::Handler(HandlerPattern::PopReg { pair, .. }) = first else {
        panic!("expected pop_reg, got {first:?}");
    };
    assert_eq!(pair, RegisterPair::new("ESI", "EBP"));
    // Classification reports the pair; it never selects it.
    assert!(!registers.is_selected());
}

#[test]
fn conflicting_selection_rejects_pop_pattern() {
    let pop = body(Handler::Pop);
    let ir = pop.ir.as_ref().expect("pop handler lifts");
    let (node, decoder) = occurrence(&pop);
    let registers = VmRegisterSet::selected(RegisterPair::new("EDI", "EBP"));

    let classification = classify(ir, &node, &registers, &decoder);
    assert!(!matches!(
        classification,
        Classification::Handler(HandlerPattern::PopReg { .. })
    ));
}

#[test]
fn selection_survives_a_mismatch_until_cleared() {
    let mut registers = VmRegisterSet::new();
    registers.select(RegisterPair::new("ESI", "EBP")).unwrap();

    assert!(registers.select(RegisterPair::new("EDI", "EBP")).is_err());
    assert_eq!(registers.code(), Some("ESI"));

    registers.clear();
    registers.select(RegisterPair::new("EDI", "EBX")).unwrap();
    assert_eq!(registers.stack(), Some("EBX"));
}

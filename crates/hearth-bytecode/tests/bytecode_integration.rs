//! Integration tests for program assembly and the durable text codec

use hearth_bytecode::{text::LineReader, Literal, Opcode, Program, ProgramBuilder, VectorId};

fn sample() -> Program {
    let mut b = ProgramBuilder::new();
    let x = b.var("x");
    let top = b.label();
    let end = b.label();
    b.line(1);
    b.imm_int(0).put_var(x).op(Opcode::Pop);
    b.line(2);
    b.imm_int(1).imm_int(10);
    b.here(top);
    b.iter_for_range(x, end);
    b.jump(Opcode::Jump, top);
    b.here(end);
    b.line(3);
    b.push_var(x).op(Opcode::Return);

    let fork = b.start_fork();
    b.op(Opcode::Done);
    b.select_main();
    let _ = fork;
    b.build()
}

#[test]
fn test_built_program_roundtrips_through_text() {
    let program = sample();
    let mut buf = Vec::new();
    program.encode_text(&mut buf).unwrap();
    let mut reader = LineReader::new(&buf[..]);
    let decoded = Program::decode_text(&mut reader).unwrap();
    assert_eq!(decoded, program);
}

#[test]
fn test_line_numbers_follow_pcs() {
    let program = sample();
    assert_eq!(program.line_for(VectorId::Main, 0), Some(1));
    // Last instruction belongs to line 3.
    let last = program.main.code.len() - 1;
    assert_eq!(program.line_for(VectorId::Main, last), Some(3));
}

#[test]
fn test_disassembly_covers_every_instruction() {
    let program = sample();
    let listing = program.disassemble(VectorId::Main);
    assert!(listing.iter().any(|l| l.contains("iter_for_range")));
    assert!(listing.last().unwrap().contains("return"));

    let fork_listing = program.disassemble(VectorId::Fork(0));
    assert_eq!(fork_listing.len(), 1);
    assert!(fork_listing[0].contains("done"));
}

#[test]
fn test_literal_pool_roundtrip() {
    let mut b = ProgramBuilder::new();
    b.imm(Literal::List(vec![
        Literal::Str("nested\t".into()),
        Literal::Map(vec![(Literal::Int(1), Literal::Float(2.5))]),
        Literal::Err(3),
    ]));
    b.op(Opcode::Return);
    let program = b.build();

    let mut buf = Vec::new();
    program.encode_text(&mut buf).unwrap();
    let mut reader = LineReader::new(&buf[..]);
    let decoded = Program::decode_text(&mut reader).unwrap();
    assert_eq!(decoded.literals, program.literals);
}

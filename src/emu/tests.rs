use super::*;

// MOV X0, #5; MOV X1, #3; ADD X2, X0, X1; RET
const ADD_TEST_CODE: [u8; 16] = [
    0xa0, 0x00, 0x80, 0xd2, // MOV X0, #5
    0x61, 0x00, 0x80, 0xd2, // MOV X1, #3
    0x02, 0x00, 0x01, 0x8b, // ADD X2, X0, X1
    0xc0, 0x03, 0x5f, 0xd6, // RET
];

#[test]
fn basic_run() {
    let mut emu = Emulator::new().expect("create emulator");
    emu.load_code(&ADD_TEST_CODE).unwrap();
    emu.set_lr(SENTINEL).unwrap();

    let end = CODE_BASE + ADD_TEST_CODE.len() as u64;
    let _ = emu.run(CODE_BASE, end);

    assert_eq!(emu.x(0), 5);
    assert_eq!(emu.x(1), 3);
    assert_eq!(emu.x(2), 8);
}

#[test]
fn memory_round_trips() {
    let mut emu = Emulator::new().unwrap();

    emu.mem_write_u64(HEAP_BASE, 0x1234_5678_9ABC_DEF0).unwrap();
    assert_eq!(emu.mem_read_u64(HEAP_BASE).unwrap(), 0x1234_5678_9ABC_DEF0);

    emu.mem_write_u32(HEAP_BASE + 0x100, 0xCAFE_BABE).unwrap();
    assert_eq!(emu.mem_read_u32(HEAP_BASE + 0x100).unwrap(), 0xCAFE_BABE);

    emu.mem_write_u16(HEAP_BASE + 0x200, 0xBEEF).unwrap();
    assert_eq!(emu.mem_read_u16(HEAP_BASE + 0x200).unwrap(), 0xBEEF);

    let addr = emu.malloc(64);
    emu.mem_write_string(addr, "Hello, Galago!").unwrap();
    assert_eq!(emu.mem_read_string(addr, 64).unwrap(), "Hello, Galago!");
}

#[test]
fn malloc_is_aligned_and_disjoint() {
    let mut emu = Emulator::new().unwrap();

    let a = emu.malloc(100);
    let b = emu.malloc(200);
    let c = emu.malloc(50);

    assert_eq!(a % 16, 0);
    assert_eq!(b % 16, 0);
    assert_eq!(c % 16, 0);
    assert!(b >= a + 112);
    assert!(c >= b + 208);
}

#[test]
fn address_map_invariants() {
    let emu = Emulator::new().unwrap();

    // Canary where __stack_chk_guard points.
    assert_eq!(
        emu.mem_read_u64(TLS_BASE + 0x28).unwrap(),
        0xDEAD_BEEF_DEAD_BEEF
    );

    // _ctype_ pointer dereferences to table+1.
    let ctype_ptr = emu.mem_read_u64(emu.get_ctype_ptr()).unwrap();
    assert_eq!(ctype_ptr, LIBC_BASE + CTYPE_TABLE_OFFSET + 1);

    // Both mock objects carry the mock vtable at offset 0.
    let mock_vtable = MOCK_OBJ_BASE + 0x1010;
    let mock_obj = emu.get_mock_object();
    let mock_obj2 = MOCK_OBJ_BASE + 0x3000;
    assert_eq!(emu.mem_read_u64(mock_obj).unwrap(), mock_vtable);
    assert_eq!(emu.mem_read_u64(mock_obj2).unwrap(), mock_vtable);

    // Member pointers of mock_obj all reach mock_obj2.
    for i in 1..VTABLE_STUB_COUNT {
        assert_eq!(
            emu.mem_read_u64(mock_obj + i * 8).unwrap(),
            mock_obj2,
            "mock_obj slot {i}"
        );
    }

    // Vtable slots point at the stub bodies, each a RET.
    let stubs = emu.get_vtable_stubs();
    for i in [0u64, 1, 100, 255] {
        assert_eq!(emu.mem_read_u64(mock_vtable + i * 8).unwrap(), stubs + i * 4);
        assert_eq!(emu.mem_read(stubs + i * 4, 4).unwrap(), RET_INSN);
    }

    // RTTI prefix: offset_to_top 0, type_info with the mock name.
    assert_eq!(emu.mem_read_u64(MOCK_OBJ_BASE + 0x1000).unwrap(), 0);
    let typeinfo = emu.mem_read_u64(MOCK_OBJ_BASE + 0x1008).unwrap();
    let name_ptr = emu.mem_read_u64(typeinfo + 8).unwrap();
    assert_eq!(
        emu.mem_read_string(name_ptr, 32).unwrap(),
        "12_MockObject"
    );
}

#[test]
fn ctype_table_classification() {
    let table = build_ctype_table();

    assert_eq!(table[0], 0, "EOF entry");

    for c in 0u16..256 {
        let flags = table[c as usize + 1];
        let c = c as u8;

        let upper = flags & 0x01 != 0;
        let lower = flags & 0x02 != 0;
        let digit = flags & 0x04 != 0;
        let space = flags & 0x08 != 0;
        let punct = flags & 0x10 != 0;
        let ctrl = flags & 0x20 != 0;
        let blank = flags & 0x40 != 0;
        let hex = flags & 0x80 != 0;

        let is_ws = matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c);

        assert_eq!(upper, c.is_ascii_uppercase(), "upper bit for {c:#x}");
        assert_eq!(lower, c.is_ascii_lowercase(), "lower bit for {c:#x}");
        assert_eq!(digit, c.is_ascii_digit(), "digit bit for {c:#x}");
        assert_eq!(space, is_ws, "space bit for {c:#x}");
        assert_eq!(punct, c.is_ascii_punctuation(), "punct bit for {c:#x}");
        assert_eq!(
            ctrl,
            (c < 0x20 && !is_ws) || c == 0x7f,
            "ctrl bit for {c:#x}"
        );
        assert_eq!(blank, c == b' ' || c == b'\t', "blank bit for {c:#x}");
        assert_eq!(hex, c.is_ascii_hexdigit(), "hex bit for {c:#x}");
    }
}

#[test]
fn address_hook_fires_before_instruction() {
    let mut emu = Emulator::new().unwrap();
    emu.load_code(&ADD_TEST_CODE).unwrap();

    let hit = std::rc::Rc::new(std::cell::Cell::new(false));
    let hit2 = hit.clone();
    emu.hook_address(
        CODE_BASE + 4,
        std::rc::Rc::new(move |_e: &mut Emulator| {
            hit2.set(true);
            false
        }),
    );

    emu.set_lr(SENTINEL).unwrap();
    let _ = emu.run(CODE_BASE, CODE_BASE + ADD_TEST_CODE.len() as u64);

    assert!(hit.get());
}

#[test]
fn code_hook_counts_instructions() {
    let mut emu = Emulator::new().unwrap();
    emu.load_code(&ADD_TEST_CODE).unwrap();

    let count = std::rc::Rc::new(std::cell::Cell::new(0u64));
    let count2 = count.clone();
    emu.hook_code(std::rc::Rc::new(move |_e: &mut Emulator, _addr, _size| {
        count2.set(count2.get() + 1);
    }));

    // Stop at the sentinel before its (invalid) instruction would count.
    emu.set_lr(SENTINEL).unwrap();
    emu.hook_address(SENTINEL, std::rc::Rc::new(|_e: &mut Emulator| true));
    let _ = emu.run(CODE_BASE, CODE_BASE + ADD_TEST_CODE.len() as u64);

    assert_eq!(count.get(), 4);
}

#[test]
fn sentinel_terminates_the_run() {
    let mut emu = Emulator::new().unwrap();
    // Entry is a bare RET: LR routes straight to the sentinel. Depending on
    // the emulator build the run ends via the stop hook or a PC fault; the
    // driver treats both as normal termination.
    emu.load_code(&RET_INSN).unwrap();
    emu.set_lr(SENTINEL).unwrap();
    emu.hook_address(SENTINEL, std::rc::Rc::new(|_e: &mut Emulator| true));

    let _ = emu.run_from(CODE_BASE);
    assert_eq!(emu.pc(), SENTINEL);
}

#[test]
fn vtable_stub_returns_mock_object() {
    let mut emu = Emulator::new().unwrap();

    // BLR into vtable_stubs[0] with X8 outside the stack: the hook must hand
    // back the mock object.
    let stub = emu.get_vtable_stubs();
    emu.set_x(8, 0).unwrap();
    emu.set_lr(SENTINEL).unwrap();
    emu.hook_address(SENTINEL, std::rc::Rc::new(|_e: &mut Emulator| true));

    let _ = emu.run_from(stub);
    assert_eq!(emu.x(0), emu.get_mock_object());
}

#[test]
fn vtable_stub_materializes_return_string() {
    let mut emu = Emulator::new().unwrap();

    // X8 in the stack range means sret: the hook writes an empty COW string
    // through it.
    let sret = STACK_BASE + STACK_SIZE - 0x2000;
    let stub = emu.get_vtable_stubs() + 4;
    emu.set_x(8, sret).unwrap();
    emu.set_lr(SENTINEL).unwrap();
    emu.hook_address(SENTINEL, std::rc::Rc::new(|_e: &mut Emulator| true));

    let _ = emu.run_from(stub);

    assert_eq!(emu.x(0), sret);
    let data_ptr = emu.mem_read_u64(sret).unwrap();
    assert!((HEAP_BASE..HEAP_BASE + HEAP_SIZE).contains(&data_ptr));
    assert_eq!(emu.mem_read_u8(data_ptr).unwrap(), 0);
}

use tracebt_core::{
    Backtrace, CancelFlag, CoreError, Frame, FrameOverrides, Mode, Snapshot, Target, UnwindConfig,
    Unwinder,
};

const CPSR: u32 = 0x6000_0030;

fn snapshot(json: &str) -> Snapshot {
    Snapshot::from_json(json).expect("valid snapshot")
}

fn unwind_once(snap: &mut Snapshot, frame: &Frame) -> Result<Frame, CoreError> {
    let mut unwinder = Unwinder::new(snap.instruction_source(), UnwindConfig::default());
    unwinder.unwind(snap, frame)
}

fn first_frame(snap: &mut Snapshot) -> Frame {
    FrameOverrides::default()
        .initial_frame(snap)
        .expect("initial frame")
}

#[test]
fn leaf_bx_lr_yields_link_register() {
    let mut snap = snapshot(
        r#"{
        "registers": { "pc": "0x1000", "sp": "0x2000", "lr": "0x8001" },
        "cpsr": "0x60000030",
        "listing": { "thumb": "   0x00001000 <leaf>:\tmovs\tr0, #1\n   0x00001002 <leaf+2>:\tbx\tlr\n   0x00001004 <leaf+4>:\tnop\n   0x00001006 <leaf+6>:\tnop\n" }
    }"#,
    );
    let frame = first_frame(&mut snap);
    assert_eq!(frame, Frame::new(0x1000, 0x2000, Mode::Thumb));
    let caller = unwind_once(&mut snap, &frame).unwrap();
    assert_eq!(caller.pc(), 0x8000);
    assert_eq!(caller.sp(), 0x2000);
    assert!(caller.is_thumb());
    assert_eq!(snap.read_status().unwrap(), CPSR);
}

const PROLOGUE_LISTING: &str = "\
   0x00001000 <work>:\tpush\t{r4, lr}\n\
   0x00001002 <work+2>:\tsub\tsp, #8\n\
   0x00001004 <work+4>:\tstr\tr0, [sp, #4]\n\
   0x00001006 <work+6>:\tldr\tr4, [sp, #4]\n\
   0x00001008 <work+8>:\tadd\tsp, #8\n\
   0x0000100a <work+10>:\tpop\t{r4, pc}\n\
   0x0000100c <work+12>:\tnop\n\
   0x0000100e <work+14>:\tnop\n";

fn prologue_snapshot(pc: u32, sp: u32) -> Snapshot {
    let mut snap = Snapshot::default();
    snap.listing.thumb = PROLOGUE_LISTING.to_string();
    snap.set_register(tracebt_core::Register::Pc, pc);
    snap.set_register(tracebt_core::Register::Sp, sp);
    snap.set_register(tracebt_core::Register::Lr, 0x4001);
    snap.cpsr = tracebt_core::Word(CPSR);
    snap
}

#[test]
fn epilogue_pops_saved_return_address_from_memory() {
    // Stopped after the push: the saved r4/lr pair sits at 0x2000/0x2004.
    let mut snap = prologue_snapshot(0x1002, 0x2000);
    snap.write_word(0x2000, 0x1234);
    snap.write_word(0x2004, 0x6001);
    let frame = first_frame(&mut snap);
    let caller = unwind_once(&mut snap, &frame).unwrap();
    assert_eq!(caller, Frame::new(0x6000, 0x2008, Mode::Thumb));
    let regs = caller.registers().unwrap();
    assert_eq!(regs.get(tracebt_core::Register::R4), Some(0x1234));
}

#[test]
fn prologue_and_epilogue_round_trip_through_shadow_stack() {
    // Stopped on the push: nothing is in target memory, the pushed lr is
    // replayed by the pop.
    let mut snap = prologue_snapshot(0x1000, 0x2008);
    let frame = first_frame(&mut snap);
    let caller = unwind_once(&mut snap, &frame).unwrap();
    assert_eq!(caller, Frame::new(0x4000, 0x2008, Mode::Thumb));
}

#[test]
fn status_is_restored_after_failure() {
    let mut snap = snapshot(
        r#"{ "registers": { "pc": "0x9000", "sp": "0x2000" }, "cpsr": "0x60000030" }"#,
    );
    let frame = first_frame(&mut snap);
    let err = unwind_once(&mut snap, &frame).unwrap_err();
    assert!(matches!(
        err,
        CoreError::NoInstructions {
            address: 0x9000,
            mode: Mode::Thumb
        }
    ));
    assert_eq!(err.to_string(), "cannot load instructions at 0x9000 (thumb)");
    assert_eq!(snap.read_status().unwrap(), CPSR);
    assert_eq!(frame, Frame::new(0x9000, 0x2000, Mode::Thumb));
}

#[test]
fn loop_is_escaped_by_flipping_conditional_branch() {
    let mut snap = snapshot(
        r#"{
        "registers": { "pc": "0x1000", "sp": "0x2000", "lr": "0x5001" },
        "cpsr": "0x30",
        "listing": { "thumb": "0x1000 <spin>:\tldr\tr3, [r0]\n0x1002 <spin+2>:\tcmp\tr3, #0\n0x1004 <spin+4>:\tbne.n\t0x100a <spin+10>\n0x1006 <spin+6>:\tb.n\t0x1000 <spin>\n0x1008 <spin+8>:\tnop\n0x100a <spin+10>:\tbx\tlr\n0x100c <spin+12>:\tnop\n0x100e <spin+14>:\tnop\n" }
    }"#,
    );
    let frame = first_frame(&mut snap);
    let caller = unwind_once(&mut snap, &frame).unwrap();
    assert_eq!(caller, Frame::new(0x5000, 0x2000, Mode::Thumb));
}

#[test]
fn unconditional_self_loop_is_fatal() {
    let mut snap = snapshot(
        r#"{
        "registers": { "pc": "0x1000", "sp": "0x2000" },
        "cpsr": "0x30",
        "listing": { "thumb": "0x1000 <hang>:\tb.n\t0x1000 <hang>\n0x1002:\tnop\n0x1004:\tnop\n0x1006:\tnop\n" }
    }"#,
    );
    let frame = first_frame(&mut snap);
    assert!(matches!(
        unwind_once(&mut snap, &frame),
        Err(CoreError::InfiniteLoop { address: 0x1000 })
    ));
    assert_eq!(snap.read_status().unwrap(), 0x30);
}

const CHAIN: &str = r#"{
    "magic": "tracebt.snapshot",
    "version": 1,
    "registers": { "pc": "0x1004", "sp": "0x8000", "lr": "0x3000", "r4": 1 },
    "cpsr": "0x20",
    "memory": [
        ["0x8000", "0x44"], ["0x8004", "0x2001"],
        ["0x8008", "0x77"], ["0x800c", "0x3000"]
    ],
    "symbols": [
        { "start": "0x1000", "end": "0x1100", "name": "inner(int)", "library": "/system/lib/libfoo.so" },
        { "start": "0x2000", "end": "0x2100", "name": "middle + 4" }
    ],
    "listing": {
        "thumb": "0x1004 <inner+4>:\tpop\t{r4, pc}\n0x1006:\tnop\n0x1008:\tnop\n0x100a:\tnop\n0x2000 <middle>:\tmovs\tr0, #0\n0x2002 <middle+2>:\tpop\t{r7, pc}\n0x2004:\tnop\n0x2006:\tnop\n",
        "arm": "0x3000:\tbx\tlr\n0x3004:\tnop\n0x3008:\tnop\n"
    }
}"#;

#[test]
fn backtrace_walks_to_fixed_point() {
    let mut snap = snapshot(CHAIN);
    let mut unwinder = Unwinder::new(snap.instruction_source(), UnwindConfig::default());
    let mut lines = Vec::new();
    {
        let mut bt = Backtrace::new(&mut unwinder, &mut snap, FrameOverrides::default()).unwrap();
        while let Some(frame) = bt.next_frame().unwrap() {
            let desc = frame.describe(bt.target_mut());
            lines.push(format!("#{}: {desc}", lines.len()));
        }
    }
    assert_eq!(
        lines,
        vec![
            "#0: frame 0x008000 in function inner (0x001004) from libfoo.so",
            "#1: frame 0x008008 in function middle (0x002000) from ??",
            "#2: frame 0x008010 in function ?? (0x003000) from ??",
        ]
    );
    assert_eq!(snap.read_status().unwrap(), 0x20);
}

#[test]
fn max_frames_bounds_the_walk() {
    let mut snap = snapshot(CHAIN);
    let config = UnwindConfig {
        max_frames: 2,
        ..Default::default()
    };
    let mut unwinder = Unwinder::new(snap.instruction_source(), config);
    let frames: Vec<Frame> = Backtrace::new(&mut unwinder, &mut snap, FrameOverrides::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        frames,
        vec![
            Frame::new(0x1004, 0x8000, Mode::Thumb),
            Frame::new(0x2000, 0x8008, Mode::Thumb),
        ]
    );
}

#[test]
fn overrides_start_the_walk_elsewhere() {
    let mut snap = snapshot(CHAIN);
    let mut unwinder = Unwinder::new(snap.instruction_source(), UnwindConfig::default());
    let overrides = FrameOverrides {
        pc: Some(0x2001),
        sp: Some(0x8008),
        thumb: None,
    };
    let frames: Vec<Frame> = Backtrace::new(&mut unwinder, &mut snap, overrides)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], Frame::new(0x2000, 0x8008, Mode::Thumb));
    assert_eq!(frames[1], Frame::new(0x3000, 0x8010, Mode::Arm));
}

#[test]
fn cancel_flag_interrupts_a_running_backtrace() {
    let mut snap = snapshot(CHAIN);
    let cancel = CancelFlag::new();
    let mut unwinder = Unwinder::new(snap.instruction_source(), UnwindConfig::default())
        .with_cancel_flag(cancel.clone());
    let handle = unwinder.cancel_flag();
    {
        let mut bt = Backtrace::new(&mut unwinder, &mut snap, FrameOverrides::default()).unwrap();
        assert_eq!(
            bt.next_frame().unwrap(),
            Some(Frame::new(0x1004, 0x8000, Mode::Thumb))
        );
        handle.cancel();
        assert!(matches!(bt.next_frame(), Err(CoreError::Interrupted)));
        assert!(bt.next_frame().unwrap().is_none());
    }
    assert!(cancel.is_cancelled());
    assert_eq!(snap.read_status().unwrap(), 0x20);
}

//! Full programming sequences against the simulated target.

use std::sync::{Arc, Mutex};

use ch32_flash::fake_probe::Operation;
use ch32_flash::flashing::{FLASH_KEY1, FLASH_KEY2};
use ch32_flash::{
    download_firmware, download_firmware_with_options, Ch32Error, DownloadOptions, FakeProbe,
    FlashError, FlashProgress, ProgressEvent, FLASH_BASE,
};

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index % 251) as u8).collect()
}

/// Collects progress events into a shared vector.
fn collecting_progress() -> (FlashProgress, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let progress = FlashProgress::new(move |event| sink.lock().unwrap().push(event));

    (progress, events)
}

fn first_index(operations: &[Operation], wanted: Operation) -> usize {
    operations
        .iter()
        .position(|operation| *operation == wanted)
        .unwrap_or_else(|| panic!("operation {wanted:?} never happened"))
}

#[test_log::test]
fn program_two_blocks_end_to_end() {
    let firmware = image(512);
    let mut probe = FakeProbe::new();
    let (progress, events) = collecting_progress();

    let options = DownloadOptions {
        progress: Some(&progress),
    };
    download_firmware_with_options(&mut probe, &firmware, options).unwrap();

    // The flash now holds the image, the rest of it is still erased.
    assert_eq!(&probe.flash_contents()[..512], &firmware[..]);
    assert!(probe.flash_contents()[512..].iter().all(|byte| *byte == 0xff));

    // Two blocks, each erased once and programmed once.
    assert_eq!(probe.erase_count(), 2);
    assert_eq!(probe.program_count(), 2);

    // One progress event per block, counting the bytes completed before the
    // block.
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[
            ProgressEvent::StartedProgramming { total: 512 },
            ProgressEvent::ProgrammingBlock {
                address: FLASH_BASE,
                bytes_programmed: 0,
                total: 512,
            },
            ProgressEvent::ProgrammingBlock {
                address: FLASH_BASE + 256,
                bytes_programmed: 256,
                total: 512,
            },
            ProgressEvent::FinishedProgramming,
        ]
    );

    // The sequence starts with the link bring-up, halts the core before the
    // first unlock key goes out, and ends with the core reset and running.
    let operations = probe.operations();
    assert_eq!(operations[0], Operation::Init);
    assert_eq!(operations[1], Operation::Reset);

    let halt_request = first_index(
        operations,
        Operation::WriteDmRegister {
            address: 0x10,
            value: 0x8000_0001,
        },
    );
    let first_key = first_index(
        operations,
        Operation::WriteDmRegister {
            address: 0x04,
            value: FLASH_KEY1,
        },
    );
    let reset_request = first_index(
        operations,
        Operation::WriteDmRegister {
            address: 0x10,
            value: 0x0000_0003,
        },
    );
    assert!(halt_request < first_key);
    assert!(first_key < reset_request);

    // The unlock sequence stages each key half once per key register.
    let key_writes = |key: u32| {
        operations
            .iter()
            .filter(|operation| {
                matches!(
                    operation,
                    Operation::WriteDmRegister { address: 0x04, value } if *value == key
                )
            })
            .count()
    };
    assert_eq!(key_writes(FLASH_KEY1), 3);
    assert_eq!(key_writes(FLASH_KEY2), 3);

    assert!(!probe.core_halted());
}

#[test_log::test]
fn halt_timeout_aborts_before_any_flash_access() {
    let firmware = image(512);
    let mut probe = FakeProbe::new();
    probe.ignore_halt_requests();

    let result = download_firmware(&mut probe, &firmware);

    assert!(matches!(
        result,
        Err(FlashError::Core(Ch32Error::HaltTimeout(_)))
    ));

    // No unlock key ever went out, nothing was erased.
    assert!(!probe.operations().contains(&Operation::WriteDmRegister {
        address: 0x04,
        value: FLASH_KEY1,
    }));
    assert_eq!(probe.erase_count(), 0);
    assert!(probe.flash_contents().iter().all(|byte| *byte == 0xff));
}

#[test_log::test]
fn transport_failure_at_the_second_key_write_aborts_the_sequence() {
    let firmware = image(512);

    // Dry run to locate the transport operation that stages the second
    // unlock key.
    let mut reference = FakeProbe::new();
    download_firmware(&mut reference, &firmware).unwrap();
    let second_key = first_index(
        reference.operations(),
        Operation::WriteDmRegister {
            address: 0x04,
            value: FLASH_KEY2,
        },
    );

    let mut probe = FakeProbe::new();
    probe.fail_after(second_key);

    let result = download_firmware(&mut probe, &firmware);

    assert!(matches!(
        result,
        Err(FlashError::Core(Ch32Error::Probe(_)))
    ));

    // The failed operation is the last one in the log; nothing ran after it.
    assert_eq!(probe.operations().len(), second_key + 1);
    assert_eq!(
        probe.operations().last(),
        Some(&Operation::WriteDmRegister {
            address: 0x04,
            value: FLASH_KEY2,
        })
    );

    // The flash was never touched, and with no cleanup pass the core is
    // left halted.
    assert_eq!(probe.erase_count(), 0);
    assert!(probe.flash_contents().iter().all(|byte| *byte == 0xff));
    assert!(probe.core_halted());
}

#[test_log::test]
fn partial_final_block_is_padded_with_erased_pattern() {
    let firmware = image(300);
    let mut probe = FakeProbe::new();

    download_firmware(&mut probe, &firmware).unwrap();

    assert_eq!(&probe.flash_contents()[..300], &firmware[..]);
    assert!(probe.flash_contents()[300..512]
        .iter()
        .all(|byte| *byte == 0xff));
    assert_eq!(probe.erase_count(), 2);
}

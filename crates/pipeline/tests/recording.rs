use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flim_pipeline::{
    CaptureResult, PipelineError, RecordingBuffer, StartOutcome, UnsavedDecision,
};
use flim_types::{
    AveragedImage, ChannelMode, PipelineEvent, PulseWindows, ScanGeometry, SessionConfig, CHANNEL_COUNT,
};
use flume::Receiver;

fn session(image_capacity: usize) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.geometry = ScanGeometry {
        n_scans: 8,
        n_pixels: 4,
        n_times: 2,
        n_segments: 32,
        n_lines: 4,
        comp_pixels: 0,
    };
    config.processing.windows = PulseWindows::new([0, 2, 4, 6, 8]).unwrap();
    config.imaging.galvo_shift = 0;
    config.imaging.flying_back = 1;
    config.recording.image_capacity = image_capacity;
    config.recording.staging_depth = 2;
    config
}

/// Channel `c` of image `seq` holds `seq * 10 + c` everywhere.
fn test_image(seq: u64) -> AveragedImage {
    AveragedImage {
        sequence: seq,
        n_pixels: 4,
        n_lines: 4,
        accumulation: 1,
        averaging: 1,
        channels: std::array::from_fn(|c| vec![(seq * 10) as f32 + c as f32; 16]),
    }
}

fn record(recorder: &RecordingBuffer, count: u64) {
    assert_eq!(
        recorder.start_recording(UnsavedDecision::Ignore).unwrap(),
        StartOutcome::Started
    );
    for seq in 0..count {
        // The copy thread may lag behind a burst of captures.
        while recorder.capture_image(&test_image(seq)) == CaptureResult::Dropped {
            std::thread::yield_now();
        }
    }
    recorder.stop_recording().unwrap();
}

fn save_finished(events: &Receiver<PipelineEvent>) -> Vec<bool> {
    events
        .try_iter()
        .filter_map(|e| match e {
            PipelineEvent::SaveFinished { success } => Some(success),
            _ => None,
        })
        .collect()
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[test]
fn saved_file_holds_every_image_in_capture_order() {
    let config = session(8);
    let (tx, events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 5);
    assert_eq!(recorder.recorded_images(), 5);
    assert!(recorder.has_unsaved());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.data");
    recorder.start_saving(&path).unwrap();
    let report = recorder.wait_for_save().unwrap().unwrap();
    assert_eq!(report.images, 5);
    assert_eq!(report.pulses, 0);
    assert!(recorder.is_saved());
    assert!(!recorder.is_saving());
    assert_eq!(save_finished(&events), vec![true]);

    let bytes = fs::read(&path).unwrap();
    let record_len = CHANNEL_COUNT * 4 * 4;
    assert_eq!(bytes.len(), 5 * record_len * 4);
    let mut values = vec![0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes, &mut values);
    for (seq, chunk) in values.chunks(record_len).enumerate() {
        for (c, plane) in chunk.chunks(16).enumerate() {
            assert!(plane.iter().all(|&v| v == (seq * 10 + c) as f32));
        }
    }

    // One bitmap per channel and image, one folder per channel.
    assert_eq!(report.bitmaps.len(), 5 * CHANNEL_COUNT);
    assert_eq!(count_files(&dir.path().join("scaled_image")), 5 * CHANNEL_COUNT);
    let first = dir
        .path()
        .join("scaled_image")
        .join("SHG")
        .join("SHG_image_acc_1_avg_1_[0.0 1.0]_001.bmp");
    let bitmap = image::open(&first).unwrap().to_luma8();
    assert_eq!(bitmap.dimensions(), (4, 3));

    let saved = SessionConfig::from_json(&fs::read_to_string(dir.path().join("scan.json")).unwrap()).unwrap();
    assert_eq!(saved, config);
    assert!(!dir.path().join("scan.pulse").exists());
}

#[test]
fn capacity_caps_the_recording() {
    let config = session(3);
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    recorder.start_recording(UnsavedDecision::Ignore).unwrap();
    let mut results = Vec::new();
    for seq in 0..5 {
        let mut result = recorder.capture_image(&test_image(seq));
        while result == CaptureResult::Dropped {
            std::thread::yield_now();
            result = recorder.capture_image(&test_image(seq));
        }
        results.push(result);
    }
    let summary = recorder.stop_recording().unwrap();
    assert_eq!(&results[..3], &[CaptureResult::Captured; 3]);
    assert_eq!(&results[3..], &[CaptureResult::Full; 2]);
    assert_eq!(summary.images, 3);
    assert_eq!(summary.bytes, 3 * CHANNEL_COUNT * 16 * 4);
}

#[test]
fn unsaved_data_decisions() {
    let config = session(4);
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 2);

    assert_eq!(
        recorder.start_recording(UnsavedDecision::Cancel).unwrap(),
        StartOutcome::Cancelled
    );
    assert!(!recorder.is_recording());
    assert_eq!(recorder.recorded_images(), 2);

    assert_eq!(
        recorder.start_recording(UnsavedDecision::Discard).unwrap(),
        StartOutcome::Discarded
    );
    assert!(!recorder.is_recording());
    assert_eq!(recorder.recorded_images(), 0);
    assert!(recorder.is_saved());

    let generation = recorder.generation();
    assert_eq!(
        recorder.start_recording(UnsavedDecision::Cancel).unwrap(),
        StartOutcome::Started
    );
    assert!(recorder.is_recording());
    assert!(recorder.generation() > generation);
    assert!(recorder.session_id().is_some());
    assert!(matches!(
        recorder.start_recording(UnsavedDecision::Ignore),
        Err(PipelineError::AlreadyRecording)
    ));
    recorder.stop_recording().unwrap();
}

#[test]
fn recording_state_errors() {
    let config = session(4);
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    assert!(matches!(recorder.stop_recording(), Err(PipelineError::NotRecording)));
    assert_eq!(recorder.capture_image(&test_image(0)), CaptureResult::NotRecording);

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        recorder.start_saving(dir.path().join("empty.data")),
        Err(PipelineError::NothingRecorded)
    ));

    recorder.start_recording(UnsavedDecision::Ignore).unwrap();
    assert!(matches!(
        recorder.start_saving(dir.path().join("busy.data")),
        Err(PipelineError::AlreadyRecording)
    ));
    recorder.stop_recording().unwrap();
}

#[test]
fn save_refuses_to_overwrite() {
    let config = session(4);
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("existing.data");
    fs::write(&path, b"keep me").unwrap();
    assert!(matches!(
        recorder.start_saving(&path),
        Err(PipelineError::FileExists(_))
    ));
    assert_eq!(fs::read(&path).unwrap(), b"keep me");
    assert!(recorder.has_unsaved());
}

#[test]
fn failed_save_keeps_the_recording() {
    let config = session(4);
    let (tx, events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 2);

    let dir = tempfile::tempdir().unwrap();
    let unreachable = dir.path().join("missing").join("scan.data");
    recorder.start_saving(&unreachable).unwrap();
    assert!(matches!(recorder.wait_for_save(), Err(PipelineError::IoError(_))));
    assert!(!recorder.is_saving());
    assert!(recorder.has_unsaved());
    assert_eq!(recorder.recorded_images(), 2);

    let retry = dir.path().join("scan.data");
    recorder.start_saving(&retry).unwrap();
    assert_eq!(recorder.wait_for_save().unwrap().unwrap().images, 2);
    assert_eq!(save_finished(&events), vec![false, true]);
}

#[test]
fn target_named_like_a_companion_is_refused() {
    let config = session(4);
    let (tx, events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 1);

    let dir = tempfile::tempdir().unwrap();
    for name in ["scan.json", "scan.pulse"] {
        assert!(matches!(
            recorder.start_saving(dir.path().join(name)),
            Err(PipelineError::CompanionCollision(_))
        ));
    }
    assert_eq!(count_files(dir.path()), 0);
    assert!(!recorder.is_saving());
    assert!(recorder.has_unsaved());
    assert!(save_finished(&events).is_empty());
}

#[test]
fn existing_companion_file_is_never_overwritten() {
    let config = session(4);
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 1);

    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("scan.json");
    fs::write(&settings, b"precious").unwrap();
    match recorder.start_saving(dir.path().join("scan.data")) {
        Err(PipelineError::FileExists(path)) => assert_eq!(path, settings),
        other => panic!("expected FileExists, got {:?}", other),
    }
    assert_eq!(fs::read(&settings).unwrap(), b"precious");
    assert!(!dir.path().join("scan.data").exists());
    assert!(recorder.has_unsaved());
}

#[test]
fn existing_pulse_file_blocks_a_raw_recording_save() {
    let mut config = session(4);
    config.recording.record_pulses = true;
    config.recording.pulse_capacity = 4;
    let frame = vec![7u16; config.geometry.frame_len()];
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    recorder.start_recording(UnsavedDecision::Ignore).unwrap();
    while recorder.capture_pulse(&frame) == CaptureResult::Dropped {
        std::thread::yield_now();
    }
    recorder.stop_recording().unwrap();
    assert_eq!(recorder.recorded_pulses(), 1);

    let dir = tempfile::tempdir().unwrap();
    let pulses = dir.path().join("scan.pulse");
    fs::write(&pulses, b"older run").unwrap();
    assert!(matches!(
        recorder.start_saving(dir.path().join("scan.data")),
        Err(PipelineError::FileExists(path)) if path == pulses
    ));
    assert_eq!(fs::read(&pulses).unwrap(), b"older run");
}

#[test]
fn bitmaps_are_named_after_the_wired_channel_modes() {
    let mut config = session(4);
    config.recording.channel_modes = [ChannelMode::Rcm, ChannelMode::Cars, ChannelMode::Tpfe, ChannelMode::Shg];
    let (tx, _events) = flume::unbounded();
    let recorder = RecordingBuffer::allocate(&config, tx).unwrap();
    record(&recorder, 1);

    let dir = tempfile::tempdir().unwrap();
    recorder.start_saving(dir.path().join("scan.data")).unwrap();
    let report = recorder.wait_for_save().unwrap().unwrap();
    let names: Vec<String> = report
        .bitmaps
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names[0].starts_with("RCM_image"));
    assert!(names[3].starts_with("SHG_image"));

    // Channel 0 of the first image holds 0.0 everywhere, channel 3 holds 3.0.
    let rcm = image::open(&report.bitmaps[0]).unwrap().to_luma8();
    assert!(rcm.pixels().all(|p| p.0[0] == 0));
}

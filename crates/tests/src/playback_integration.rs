//! Integration tests for the playback pipeline
//!
//! These tests drive the whole chain the way the audio output does: WAV input
//! resolved by the format registry, prefetched on the worker thread, pulled
//! through the equalizer in fixed-size blocks.

use ballad_core::domain::audio::{BlockProducer, PlaybackSpec};
use ballad_core::domain::config::{BalladConfig, ConfigManager};
use ballad_core::domain::equalizer::Band;
use ballad_core::domain::events::{Parameter, PlayerEvent, PlayerListener};
use ballad_core::domain::input::InputKind;
use ballad_core::domain::ownership::Ownership;
use ballad_core::domain::reader::FormatRegistry;
use ballad_infra::audio::BasicFormats;
use ballad_infra::playback::{PlaybackController, PrefetchWorker, StreamState};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SAMPLE_RATE: u32 = 44100;
const BLOCK: usize = 512;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<PlayerEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PlayerListener for Recorder {
    fn on_player_event(&self, event: &PlayerEvent) {
        self.events.lock().unwrap().push(*event);
    }
}

/// Mono 16-bit samples that are never zero, so padding is recognisable
fn sample_at(frame: usize) -> i16 {
    (frame % 30_000) as i16 + 1
}

fn mono_wav(frames: usize) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for frame in 0..frames {
            writer.write_sample(sample_at(frame)).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn write_wav(dir: &Path, name: &str, frames: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, mono_wav(frames)).unwrap();
    path
}

fn mono_config() -> BalladConfig {
    let mut config = BalladConfig::factory_default();
    config.engine.channels = 1;
    config.engine.sample_rate = SAMPLE_RATE;
    config.engine.block_size = BLOCK as u32;
    config
}

fn mono_player() -> (PlaybackController, Box<dyn BlockProducer>, Arc<Recorder>) {
    let config = mono_config();
    let mut player = PlaybackController::new(&config).unwrap();
    let mut output = player.take_output().unwrap();
    output.prepare(config.engine.playback_spec()).unwrap();

    let recorder = Arc::new(Recorder::default());
    player.add_listener(recorder.clone());
    (player, output, recorder)
}

/// Pull blocks like the device callback until `done` or a timeout
fn pull_until(
    output: &mut dyn BlockProducer,
    mut done: impl FnMut(&[f32]) -> bool,
) -> bool {
    let mut block = vec![0.0; BLOCK];
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        output.pull_block(&mut block);
        if done(&block) {
            return true;
        }
    }
    false
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round() as i16
}

// ============================================================================
// END TO END
// ============================================================================

#[test]
fn test_four_seconds_mono_plays_exactly_once() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), "four_seconds.wav", 4 * SAMPLE_RATE as usize);
    let (mut player, mut output, recorder) = mono_player();

    player.set_file(&path).unwrap();
    player.start();

    assert!(pull_until(output.as_mut(), |_| player.has_stream_finished()));

    assert_eq!(player.stats().frames_played, 176_400);
    assert_eq!(player.state(), StreamState::Finished);
    assert_eq!(player.position(), 176_399);
    assert_eq!(
        recorder.events(),
        vec![
            PlayerEvent::InputChanged,
            PlayerEvent::TransportChanged { playing: true },
        ]
    );

    // The end is reported once by polling
    assert!(player.poll_transport());
    assert!(!player.poll_transport());
    assert_eq!(recorder.events().len(), 3);
}

#[test]
fn test_bypassed_output_matches_file() {
    let dir = TempDir::new().unwrap();
    let frames = 20_000;
    let path = write_wav(dir.path(), "ramp.wav", frames);
    let (mut player, mut output, _) = mono_player();

    player.set_bypass(true);
    player.set_file(&path).unwrap();
    assert_eq!(player.file(), Some(path.as_path()));
    assert_eq!(player.input_kind(), InputKind::File);
    player.start();

    let mut played = Vec::new();
    assert!(pull_until(output.as_mut(), |block| {
        played.extend(block.iter().copied().filter(|&s| s != 0.0).map(to_i16));
        played.len() >= frames
    }));

    let expected: Vec<i16> = (0..frames).map(sample_at).collect();
    assert_eq!(played, expected);
}

#[test]
fn test_looping_keeps_playing_past_the_end() {
    let (mut player, mut output, _) = mono_player();
    let frames = 5_000;

    player.set_looping(true);
    player.set_memory_stream(mono_wav(frames)).unwrap();
    player.set_bypass(true);
    player.start();

    let mut played = Vec::new();
    assert!(pull_until(output.as_mut(), |block| {
        played.extend(block.iter().copied().filter(|&s| s != 0.0).map(to_i16));
        played.len() >= 3 * frames
    }));

    let once: Vec<i16> = (0..frames).map(sample_at).collect();
    for repetition in played[..3 * frames].chunks(frames) {
        assert_eq!(repetition, once.as_slice());
    }
    assert!(!player.has_stream_finished());
    assert!(player.position() < frames as u64);
}

#[test]
fn test_seek_then_play_serves_new_position() {
    let (mut player, mut output, recorder) = mono_player();
    player.set_memory_block(Arc::from(mono_wav(3 * SAMPLE_RATE as usize))).unwrap();
    player.set_bypass(true);

    player.set_position_seconds(2.0);
    player.start();

    // Stale frames may play before the jump; positions past the target only come after it
    let target = 2 * SAMPLE_RATE as u64;
    let mut jumped = None;
    assert!(pull_until(output.as_mut(), |block| {
        let position = player.position();
        if position > target && block.iter().all(|&s| s != 0.0) {
            jumped = Some((position as usize, block.iter().copied().map(to_i16).collect::<Vec<_>>()));
        }
        jumped.is_some()
    }));

    let (position, block) = jumped.unwrap();
    assert!(position <= 3 * SAMPLE_RATE as usize, "position {position}");
    let expected: Vec<i16> = (position - BLOCK..position).map(sample_at).collect();
    assert_eq!(block, expected);

    // Seeking does not notify
    let seeks = recorder
        .events()
        .iter()
        .filter(|e| !matches!(e, PlayerEvent::ParameterChanged { .. }))
        .count();
    assert_eq!(seeks, 2);
}

#[test]
fn test_start_from_zero_restarts_finished_stream() {
    let (mut player, mut output, _) = mono_player();
    player.set_memory_stream(mono_wav(2_000)).unwrap();
    player.start();
    assert!(pull_until(output.as_mut(), |_| player.has_stream_finished()));
    let played = player.stats().frames_played;

    // Start alone keeps it finished
    player.start();
    assert_eq!(player.state(), StreamState::Finished);

    player.start_from_zero();
    assert!(!player.has_stream_finished());
    assert!(pull_until(output.as_mut(), |_| player.has_stream_finished()));
    assert_eq!(player.stats().frames_played, played + 2_000);
}

#[test]
fn test_seeks_near_the_end_report_one_stop() {
    let (mut player, mut output, recorder) = mono_player();
    player.set_memory_stream(mono_wav(2_000)).unwrap();
    player.start();

    for _ in 0..20 {
        player.set_position(1_990);
        assert!(!player.has_stream_finished());
        assert_ne!(player.state(), StreamState::Finished);
        assert!(!player.poll_transport());
        assert!(pull_until(output.as_mut(), |_| player.has_stream_finished()));
    }

    assert!(player.poll_transport());
    let stops = recorder
        .events()
        .into_iter()
        .filter(|event| *event == PlayerEvent::TransportChanged { playing: false })
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn test_unrecognised_input_leaves_player_empty() {
    let (mut player, mut output, recorder) = mono_player();
    player.set_memory_stream(mono_wav(1_000)).unwrap();

    assert!(player.set_memory_stream(b"ID3\x04 definitely not a wav".to_vec()).is_err());
    assert_eq!(player.state(), StreamState::Empty);
    assert_eq!(player.input_kind(), InputKind::None);

    player.start();
    let mut block = vec![1.0; BLOCK];
    output.pull_block(&mut block);
    assert!(block.iter().all(|&s| s == 0.0));
    assert_eq!(player.stats().underruns, 0);

    let inputs = recorder
        .events()
        .into_iter()
        .filter(|e| *e == PlayerEvent::InputChanged)
        .count();
    assert_eq!(inputs, 2);
}

// ============================================================================
// SHARED COLLABORATORS
// ============================================================================

#[test]
fn test_players_share_one_worker() {
    let worker = Arc::new(PrefetchWorker::spawn("shared-prefetch").unwrap());
    let formats = Arc::new(FormatRegistry::with_basic_formats());
    let config = mono_config();
    let spec = config.engine.playback_spec();

    let mut players: Vec<_> = (0..3)
        .map(|_| {
            let mut player = PlaybackController::with_collaborators(
                &config,
                Ownership::Borrowed(worker.clone()),
                Ownership::Borrowed(formats.clone()),
            );
            let mut output = player.take_output().unwrap();
            output.prepare(spec).unwrap();
            (player, output)
        })
        .collect();

    for (i, (player, _)) in players.iter_mut().enumerate() {
        player.set_memory_stream(mono_wav(1_000 * (i + 1))).unwrap();
        player.start();
    }

    for (i, (player, output)) in players.iter_mut().enumerate() {
        assert!(pull_until(output.as_mut(), |_| player.has_stream_finished()));
        assert_eq!(player.stats().frames_played, 1_000 * (i as u64 + 1));
    }

    drop(players);
    assert_eq!(Arc::strong_count(&worker), 1);
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[tokio::test]
async fn test_saved_equalizer_settings_reach_the_player() {
    let dir = TempDir::new().unwrap();
    let manager = ConfigManager::new(dir.path().to_path_buf());

    let mut config = mono_config();
    config.equalizer.low.gain_db = -6.0;
    config.equalizer.high.gain_db = 3.0;
    manager.save(&config).await.unwrap();

    let loaded = manager.load().await;
    let player = PlaybackController::new(&loaded).unwrap();
    assert_eq!(player.band(Band::Low).gain_db, -6.0);
    assert_eq!(player.band(Band::High).gain_db, 3.0);
    assert_eq!(player.band(Band::Mid).gain_db, 0.0);

    let recorder = Arc::new(Recorder::default());
    player.add_listener(recorder.clone());
    assert!(!player.set_band_gain(Band::Low, -6.0));
    assert!(player.set_band_gain(Band::Low, -3.0));
    assert_eq!(
        recorder.events(),
        vec![PlayerEvent::ParameterChanged {
            parameter: Parameter::Gain(Band::Low),
            value: -3.0,
        }]
    );
}

#[test]
fn test_stereo_output_rejects_mono_device() {
    let config = BalladConfig::factory_default();
    let mut player = PlaybackController::new(&config).unwrap();
    let mut output = player.take_output().unwrap();

    assert!(output.prepare(PlaybackSpec::new(SAMPLE_RATE, 1, BLOCK)).is_err());
    assert!(output.prepare(PlaybackSpec::new(SAMPLE_RATE, 2, BLOCK)).is_ok());
}

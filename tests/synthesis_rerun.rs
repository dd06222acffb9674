use bg_tts::config::MetadataConfig;
use bg_tts::dispatch::{Dispatcher, DispatcherSettings, RateWindow};
use bg_tts::services::{JobError, SpeechSynthesiser};
use bg_tts::synthesis::*;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingSynthesiser {
    calls: Mutex<Vec<String>>,
}

impl RecordingSynthesiser {
    fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl SpeechSynthesiser for RecordingSynthesiser {
    fn synthesise(&self, text: &str) -> Result<Vec<u8>, JobError> {
        self.calls.lock().unwrap().push(text.to_string());
        Ok(b"RIFF".to_vec())
    }
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(
        DispatcherSettings {
            workers: 4,
            max_retries: 3,
            fallback_delay: Duration::ZERO,
        },
        Arc::new(RateWindow::unlimited()),
    )
}

#[test]
fn existing_audio_is_not_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let options = SynthesisOptions::new(dir.path(), &MetadataConfig::default());
    let sentences = (1..=10)
        .map(|i| format!("Изречение номер {}.", i))
        .collect::<Vec<_>>();
    fs::write(dir.path().join("sentence3.wav"), b"old").unwrap();

    let synthesiser = RecordingSynthesiser::default();
    let summary = synthesise_corpus(&dispatcher(), &synthesiser, &sentences, &options).unwrap();

    assert_eq!(summary.synthesised, 9);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.failed, 0);
    let calls = synthesiser.calls();
    assert_eq!(calls.len(), 9);
    assert!(!calls.contains(&"Изречение номер 3.".to_string()));
    assert_eq!(fs::read(dir.path().join("sentence3.wav")).unwrap(), b"old");

    let metadata = fs::read_to_string(options.metadata_path()).unwrap();
    let lines = metadata.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[0], "path,sentence,speaker");
    for (i, line) in lines[1..].iter().enumerate() {
        assert_eq!(*line, format!("sentence{0}.wav,Изречение номер {0}.,1", i + 1));
    }

    let synthesiser = RecordingSynthesiser::default();
    let summary = synthesise_corpus(&dispatcher(), &synthesiser, &sentences, &options).unwrap();
    assert_eq!(summary.synthesised, 0);
    assert_eq!(summary.skipped, 10);
    assert_eq!(summary.recovered, 0);
    assert!(synthesiser.calls().is_empty());
    assert_eq!(fs::read_to_string(options.metadata_path()).unwrap(), metadata);
}

#[test]
fn interrupted_run_picks_up_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let options = SynthesisOptions::new(dir.path(), &MetadataConfig::default());
    let sentences = (1..=4)
        .map(|i| format!("Ред {}.", i))
        .collect::<Vec<_>>();

    synthesise_corpus(&dispatcher(), &RecordingSynthesiser::default(), &sentences[..2], &options)
        .unwrap();

    let synthesiser = RecordingSynthesiser::default();
    let summary = synthesise_corpus(&dispatcher(), &synthesiser, &sentences, &options).unwrap();
    assert_eq!(summary.synthesised, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(synthesiser.calls(), vec!["Ред 3.", "Ред 4."]);
    assert_eq!(
        fs::read_to_string(options.metadata_path()).unwrap(),
        "path,sentence,speaker\n\
        sentence1.wav,Ред 1.,1\n\
        sentence2.wav,Ред 2.,1\n\
        sentence3.wav,Ред 3.,1\n\
        sentence4.wav,Ред 4.,1\n"
    );
}

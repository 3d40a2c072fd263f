//! Integration tests: text files to vocabularies to batches to BLEU.

use std::fs;

use agon_core::{SentenceScorer, BOS, EOS, UNK};
use agon_translate::{Bleu, CorpusConfig, ParallelCorpus, Vocab};
use candle_core::Device;

fn write_corpus(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let src = dir.join("train.src");
    let trg = dir.join("train.trg");
    fs::write(
        &src,
        "le chat noir\nun chien\n\nle chien noir mange\nune phrase beaucoup trop longue pour le filtre\n",
    )
    .unwrap();
    fs::write(
        &trg,
        "the black cat\na dog\nblank source\nthe black dog eats\na sentence\n",
    )
    .unwrap();
    (src, trg)
}

#[test]
fn files_become_sorted_batches() {
    let dir = tempfile::tempdir().unwrap();
    let (src, trg) = write_corpus(dir.path());
    let sv = Vocab::extract(&src, &dir.path().join("src.vocab"), 100).unwrap();
    let tv = Vocab::extract(&trg, &dir.path().join("trg.vocab"), 100).unwrap();
    assert!(dir.path().join("src.vocab").exists());

    let config = CorpusConfig {
        max_seq_len: 5,
        shuffle: false,
        ..CorpusConfig::default()
    };
    let corpus = ParallelCorpus::load(&src, &trg, &sv, &tv, &config).unwrap();
    let stats = corpus.stats();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.blank, 1);
    assert_eq!(stats.too_long, 1);
    assert_eq!(corpus.len(), 3);

    let lens: Vec<usize> = corpus.pairs().iter().map(|(s, _)| s.len()).collect();
    assert_eq!(lens, vec![2, 3, 4]);

    let batches = corpus.batches(2, &Device::Cpu).unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].batch_size(), 2);
    assert_eq!(batches[1].batch_size(), 1);
    let row = batches[0].target_row(0);
    assert_eq!(row.first(), Some(&BOS));
    assert_eq!(row.last(), Some(&EOS));
    assert_eq!(tv.decode(batches[0].reference_tokens(0)), "a dog");
}

#[test]
fn unknown_words_map_to_unk() {
    let sv = Vocab::from_lines(["a b c"], 100);
    assert_eq!(sv.encode("a z"), vec![sv.id("a"), UNK]);
}

#[test]
fn encoded_sentences_score_against_references() {
    let tv = Vocab::from_lines(["the black cat sat on the mat"], 100);
    let bleu = Bleu::default();
    let hyp = tv.encode("the black cat sat on the mat");
    let reference = tv.encode("the black cat sat on the mat");
    assert!((bleu.sentence_bleu(&hyp, &reference) - 1.0).abs() < 1e-6);
    let worse = tv.encode("the cat");
    assert!(bleu.sentence_bleu(&worse, &reference) < 0.5);
}

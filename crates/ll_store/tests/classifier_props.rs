use ll_proto::LogEntry;
use ll_store::classifier::{classify, Confidence};
use proptest::prelude::*;

fn entry(idx: usize, readable: bool) -> LogEntry {
    LogEntry {
        hash: format!("{idx:064x}"),
        key: format!("k{idx}"),
        value: readable.then(|| serde_json::json!({ "n": idx })),
    }
}

proptest! {
    #[test]
    fn unanimous_cipher_only_is_encrypted(n in 1usize..64) {
        let entries: Vec<_> = (0..n).map(|i| entry(i, false)).collect();
        let c = classify(&entries).unwrap();
        prop_assert!(c.encrypted);
        prop_assert_eq!(c.confidence, Confidence::Unanimous);
        prop_assert_eq!(c.entries, n);
    }

    #[test]
    fn unanimous_readable_is_unencrypted(n in 1usize..64) {
        let entries: Vec<_> = (0..n).map(|i| entry(i, true)).collect();
        prop_assert!(!classify(&entries).unwrap().encrypted);
    }

    #[test]
    fn any_mix_is_ambiguous(flags in proptest::collection::vec(any::<bool>(), 2..64)) {
        prop_assume!(flags.iter().any(|f| *f) && flags.iter().any(|f| !*f));
        let entries: Vec<_> = flags.iter().enumerate().map(|(i, r)| entry(i, *r)).collect();
        let err = classify(&entries).unwrap_err();
        prop_assert_eq!(err.readable + err.cipher_only, flags.len());
    }
}

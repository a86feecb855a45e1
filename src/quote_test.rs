use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_single_char() {
    let quoter = Quoter::new(b":", b';', false, false).unwrap();
    assert_eq!(quoter.quote(b"a:b"), b"a;058b".to_vec());
    assert_eq!(quoter.unquote(b"a;058b").unwrap(), b"a:b".to_vec());
    // the quoting char itself always quotes
    assert_eq!(quoter.quote(b"a;b"), b"a;059b".to_vec());
    assert_eq!(quoter.unquote(b"a;059b").unwrap(), b"a;b".to_vec());
}

#[test]
fn test_range_class() {
    let quoter = Quoter::new(b"A-Z", b';', false, false).unwrap();
    assert_eq!(quoter.quote(b"Abc"), b";065bc".to_vec());
    assert_eq!(quoter.quote(b"abc"), b"abc".to_vec());
    assert_eq!(quoter.unquote(b";065bc").unwrap(), b"Abc".to_vec());
}

#[test]
fn test_bijection_property() {
    let seed: u64 = random();
    println!("test_bijection_property {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let configs: Vec<(&[u8], u8)> =
        vec![(b":", b';'), (b"A-Z", b';'), (b"^a-zA-Z0-9_ .-", b'%'), (b"\\\\", b';')];
    for (ctq, qc) in configs {
        let quoter = Quoter::new(ctq, qc, true, true).unwrap();
        for _ in 0..500 {
            let len = rng.gen_range(0..40);
            let name: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
            let quoted = quoter.quote(&name);
            let back = quoter.unquote(&quoted).unwrap();
            assert_eq!(back, name, "ctq {:?} name {:?}", ctq, name);
        }
    }
}

#[test]
fn test_containment_property() {
    let seed: u64 = random();
    println!("test_containment_property {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let quoter = Quoter::new(b"^a-zA-Z0-9_.-", b'%', false, false).unwrap();
    for _ in 0..500 {
        let len = rng.gen_range(0..40);
        let name: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
        for &b in quoter.quote(&name).iter() {
            let permitted = b == b'%'
                || b.is_ascii_alphanumeric()
                || b == b'_'
                || b == b'.'
                || b == b'-';
            assert!(permitted, "byte {:?} escaped from quoting", b as char);
        }
    }
}

#[test]
fn test_dos_devices() {
    let quoter = Quoter::new(b":", b';', true, false).unwrap();
    assert_eq!(quoter.quote(b"aux"), b";097ux".to_vec());
    assert_eq!(quoter.quote(b"CON.txt"), b";067ON.txt".to_vec());
    assert_eq!(quoter.quote(b"com7"), b";099om7".to_vec());
    assert_eq!(quoter.quote(b"lpt0"), b"lpt0".to_vec()); // lpt starts at 1
    assert_eq!(quoter.quote(b"auxiliary"), b"auxiliary".to_vec());
    assert_eq!(quoter.unquote(b";097ux").unwrap(), b"aux".to_vec());
}

#[test]
fn test_trailing_spaces() {
    let quoter = Quoter::new(b":", b';', false, true).unwrap();
    assert_eq!(quoter.quote(b"name "), b"name;032".to_vec());
    assert_eq!(quoter.quote(b"name."), b"name;046".to_vec());
    assert_eq!(quoter.quote(b"na me"), b"na me".to_vec());
    assert_eq!(quoter.unquote(b"name;032").unwrap(), b"name ".to_vec());
}

#[test]
fn test_unquote_errors() {
    let quoter = Quoter::new(b":", b';', false, false).unwrap();
    match quoter.unquote(b"ab;05") {
        Err(Error::QuotingError(..)) => (),
        other => panic!("expected QuotingError, got {:?}", other),
    }
    match quoter.unquote(b"ab;xyz") {
        Err(Error::QuotingError(..)) => (),
        other => panic!("expected QuotingError, got {:?}", other),
    }
    match quoter.unquote(b"ab;999") {
        Err(Error::QuotingError(..)) => (),
        other => panic!("expected QuotingError, got {:?}", other),
    }
}

#[test]
fn test_from_config() {
    let mut config = Config::new();
    assert!(Quoter::from_config(&config).unwrap().is_none());
    config.set_chars_to_quote(b":");
    let quoter = Quoter::from_config(&config).unwrap().unwrap();
    assert_eq!(quoter.as_chars_to_quote(), b":");
    assert_eq!(quoter.to_quoting_char(), b';');
}

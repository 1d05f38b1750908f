use clients::switchboard::v1::ConnectorType;
use pretty_assertions::assert_eq as pretty_assert_eq;
use proptest::prelude::*;
use switchboard::{
    auth::Caller,
    crypto::{
        KeyId, Keyring, StateSigner, TokenHash, format_user_code, generate_access_token,
        generate_device_code, generate_user_code, normalize_user_code, USER_CODE_LEN,
    },
    error::BrokerError,
};
use test_strategy::proptest;
use time::{Duration, OffsetDateTime};

fn keyring() -> Keyring {
    Keyring::new(KeyId::new("v1"), "current secret").unwrap()
}

#[proptest]
fn sealed_payloads_open_to_the_original(
    #[strategy(proptest::collection::vec(any::<u8>(), 0..1024))] plaintext: Vec<u8>,
) {
    let keys = keyring();
    let sealed = keys.seal(&plaintext).unwrap();
    prop_assert_eq!(&sealed.key_id, &KeyId::new("v1"));
    prop_assert_eq!(keys.open(&sealed).unwrap(), plaintext);
}

#[proptest]
fn any_flipped_bit_is_detected(
    #[strategy(proptest::collection::vec(any::<u8>(), 1..256))] plaintext: Vec<u8>,
    #[strategy(any::<prop::sample::Index>())] position: prop::sample::Index,
    #[strategy(0u8..8)] bit: u8,
) {
    let keys = keyring();
    let mut sealed = keys.seal(&plaintext).unwrap();
    let index = position.index(sealed.bytes.len());
    sealed.bytes[index] ^= 1 << bit;
    prop_assert!(matches!(keys.open(&sealed), Err(BrokerError::EncryptionFailure(_))));
}

#[test]
fn same_plaintext_seals_differently() {
    let keys = keyring();
    let first = keys.seal(b"xoxb-secret").unwrap();
    let second = keys.seal(b"xoxb-secret").unwrap();
    assert_ne!(first.bytes, second.bytes);
}

#[test]
fn previous_keys_open_old_ciphertexts() {
    let old = Keyring::new(KeyId::new("v1"), "old secret").unwrap();
    let sealed = old.seal(b"payload").unwrap();

    let rotated = Keyring::new(KeyId::new("v2"), "new secret")
        .unwrap()
        .with_previous(KeyId::new("v1"), "old secret")
        .unwrap();
    pretty_assert_eq!(rotated.open(&sealed).unwrap(), b"payload".to_vec());
    pretty_assert_eq!(rotated.seal(b"payload").unwrap().key_id, KeyId::new("v2"));
}

#[test]
fn unknown_key_id_fails() {
    let mut sealed = keyring().seal(b"payload").unwrap();
    sealed.key_id = KeyId::new("v9");
    assert!(matches!(
        keyring().open(&sealed),
        Err(BrokerError::EncryptionFailure(_))
    ));
}

#[test]
fn tokens_are_hex_and_unique() {
    let device = generate_device_code();
    let access = generate_access_token();
    pretty_assert_eq!(device.expose().len(), 64);
    assert!(hex::decode(device.expose()).is_ok());
    assert_ne!(device.expose(), access.expose());
}

#[test]
fn token_hash_verifies_only_its_token() {
    let token = generate_access_token();
    let hash = TokenHash::from(&token);
    assert!(hash.verify(token.expose()));
    assert!(!hash.verify("something else"));
    pretty_assert_eq!(hash.as_bytes().len(), 32);
}

#[proptest]
fn user_codes_survive_human_formatting(#[strategy(0u8..4)] style: u8) {
    let code = generate_user_code();
    prop_assert_eq!(code.len(), USER_CODE_LEN);
    let typed = match style {
        0 => format_user_code(&code),
        1 => format_user_code(&code).to_lowercase(),
        2 => format!(" {} ", code.to_lowercase()),
        _ => code.chars().flat_map(|c| [c, ' ']).collect(),
    };
    prop_assert_eq!(normalize_user_code(&typed), code);
}

#[test]
fn state_round_trips_caller() {
    let signer = StateSigner::new("state secret");
    let caller = Caller::new("org-1", "user-1");
    let state = signer.sign(ConnectorType::Slack, &caller, Duration::minutes(10));
    pretty_assert_eq!(signer.verify(ConnectorType::Slack, &state).unwrap(), caller);
}

#[test]
fn state_rejections() {
    let signer = StateSigner::new("state secret");
    let caller = Caller::new("org-1", "user-1");
    let now = OffsetDateTime::now_utc();
    let state = signer.sign_at(ConnectorType::Slack, &caller, now + Duration::minutes(10));

    let expired = signer.verify_at(ConnectorType::Slack, &state, now + Duration::minutes(11));
    assert!(matches!(expired, Err(BrokerError::InvalidState)));

    let wrong_connector = signer.verify(ConnectorType::GitHub, &state);
    assert!(matches!(wrong_connector, Err(BrokerError::InvalidState)));

    let (claims, _) = state.split_once('.').unwrap();
    let forged = format!("{claims}.AAAA");
    assert!(matches!(
        signer.verify(ConnectorType::Slack, &forged),
        Err(BrokerError::InvalidState)
    ));
    assert!(matches!(
        signer.verify(ConnectorType::Slack, "garbage"),
        Err(BrokerError::InvalidState)
    ));
}

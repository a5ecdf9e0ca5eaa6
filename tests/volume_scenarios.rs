//! End-to-end scenarios from the testable-properties section: striping,
//! cross-row writes, single/double cell loss repair, triple-loss failure,
//! and the encrypted envelope — all against in-memory mock partitions, with
//! `D=4, C=2, R=16, B=4096` matching the reference scenarios exactly.

use std::sync::Arc;

use stripevolume::{crypto, Error, MockPartitionClient, PartitionClient, Volume};

const D: u64 = 4;
const C: u64 = 2;
const R: u64 = 16;
const B: usize = 4096;

fn build_volume(password: Option<&str>) -> (Volume, Vec<Arc<MockPartitionClient>>) {
    let volume = Volume::new("v", D, C, R, B, password).unwrap();
    let mocks: Vec<Arc<MockPartitionClient>> = (0..(D + C)).map(|_| MockPartitionClient::new(B)).collect();
    for (col, mock) in mocks.iter().enumerate() {
        volume.set_partition(col as u64, mock.clone()).unwrap();
    }
    (volume, mocks)
}

#[test]
fn simple_stripe_round_trip() {
    let (volume, _mocks) = build_volume(None);
    let payload: Vec<u8> = (0..(D as usize * B)).map(|i| (i % 256) as u8).collect();

    volume.write(&payload, 0).unwrap();
    let mut out = vec![0u8; payload.len()];
    volume.read(&mut out, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn cross_row_write_touches_two_rows_and_both_verify() {
    let (volume, _mocks) = build_volume(None);
    let payload: Vec<u8> = (0..20 * 1024usize).map(|i| ((i * 37) % 256) as u8).collect();
    let offset = 2 * 1024u64;

    volume.write(&payload, offset).unwrap();
    let mut out = vec![0u8; payload.len()];
    volume.read(&mut out, offset).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn single_cell_loss_is_repaired_transparently() {
    let (volume, mocks) = build_volume(None);
    let payload: Vec<u8> = (0..(D as usize * B)).map(|i| (i % 256) as u8).collect();
    volume.write(&payload, 0).unwrap();

    // Column 2, row 0 fails persistently until healed by a write — so
    // Row::decode genuinely has to gather column 4's code cell rather than
    // reading column 2 straight through.
    mocks[2].fail(0);
    assert!(mocks[2].is_failing(0));

    let mut out = vec![0u8; payload.len()];
    volume.read(&mut out, 0).unwrap();
    assert_eq!(out, payload);

    // Only a write (the repair storing recovered data) heals the mark, so
    // this proves the parity path ran rather than a masked direct read.
    assert!(!mocks[2].is_failing(0));
}

#[test]
fn two_cell_loss_is_repaired_using_both_code_columns() {
    let (volume, mocks) = build_volume(None);
    let payload: Vec<u8> = (0..(D as usize * B)).map(|i| (i % 256) as u8).collect();
    volume.write(&payload, 0).unwrap();

    mocks[2].fail(0);
    mocks[3].fail(0);

    let mut out = vec![0u8; payload.len()];
    volume.read(&mut out, 0).unwrap();
    assert_eq!(out, payload);

    assert!(!mocks[2].is_failing(0));
    assert!(!mocks[3].is_failing(0));
}

#[test]
fn three_cell_loss_on_one_row_is_unrecoverable_but_other_rows_are_fine() {
    let (volume, mocks) = build_volume(None);
    let payload: Vec<u8> = (0..(D as usize * B * 2)).map(|i| (i % 256) as u8).collect();
    volume.write(&payload, 0).unwrap();

    // All three marks are persistent, so Row::decode's gather loop sees all
    // three genuinely missing (not just the one Row::verify's early-exit
    // probe happened to observe) and correctly falls short of D=4.
    mocks[1].fail(0);
    mocks[2].fail(0);
    mocks[3].fail(0);

    let mut row0 = vec![0u8; D as usize * B];
    let err = volume.read(&mut row0, 0).unwrap_err();
    assert!(matches!(err, Error::RowUnrecoverable { row: 0, .. }));

    let mut row1 = vec![0u8; D as usize * B];
    volume.read(&mut row1, D as u64 * B as u64).unwrap();
    assert_eq!(row1, payload[D as usize * B..]);
}

#[test]
fn encrypted_round_trip_uses_row_byte_replicated_iv() {
    let (volume, mocks) = build_volume(Some("HelloWorld"));
    let payload: Vec<u8> = (0..8 * 1024usize).map(|i| ((i * 13) % 256) as u8).collect();
    let offset = 10 * 1024u64; // spans rows 0 and 1

    volume.write_encrypt(&payload, offset).unwrap();

    let mut out = vec![0u8; payload.len()];
    volume.read_decrypt(&mut out, offset).unwrap();
    assert_eq!(out, payload);

    // Directly decrypting the stored ciphertext of row 0 / row 1 with the
    // expected byte-replicated IVs must also recover plaintext.
    let key = crypto::derive_key("HelloWorld");
    for (row, mock) in [(0u64, &mocks[0]), (1u64, &mocks[1])] {
        let ciphertext = mock.read_block(row, 0, B as u32).unwrap();
        let plaintext = crypto::decrypt_cell(&key, row, &ciphertext).unwrap();
        assert_eq!(plaintext.len(), B);
    }
}

#[test]
fn out_of_range_request_fails_without_mutation() {
    let (volume, _mocks) = build_volume(None);
    let capacity = volume.capacity();
    let err = volume.write(&[1, 2, 3], capacity - 1).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }));
}

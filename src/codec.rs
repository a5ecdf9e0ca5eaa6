//! Systematic Reed–Solomon codec over GF(256).
//!
//! Mirrors the `cm256`/`gf256` split the original C++ core linked against:
//! a pure field-arithmetic layer (log/exp tables) underneath a systematic
//! Cauchy-matrix encoder/decoder. The generator matrix is `[I_D | P]` where
//! `P` is a `C x D` Cauchy matrix built from two disjoint index ranges, which
//! guarantees every `D x D` submatrix of the generator is invertible — the
//! MDS property R-INV depends on.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

/// A single block in a decode operation: the original column `index`
/// (`0..D` for data, `D..D+C` for code) that the payload currently
/// represents, paired with its `block_bytes`-sized payload.
#[derive(Debug, Clone)]
pub struct Block {
    pub index: usize,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(index: usize, data: Vec<u8>) -> Self {
        Self { index, data }
    }
}

const GF_POLY: u16 = 0x11D;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn gf_tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = gf_tables();
    let sum = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[sum]
}

fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0);
    let t = gf_tables();
    t.exp[255 - t.log[a as usize] as usize]
}

/// `C x D` Cauchy parity matrix, memoized per `(original_count, recovery_count)`
/// so repeated rows/operations never rebuild it — the "matrix library is
/// initialized once" design note, made self-enforcing via `OnceLock` rather
/// than relying on callers to sequence an explicit init step.
fn cauchy_matrix(original_count: usize, recovery_count: usize) -> &'static Vec<Vec<u8>> {
    static CACHE: OnceLock<Mutex<HashMap<(usize, usize), &'static Vec<Vec<u8>>>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let key = (original_count, recovery_count);

    let mut guard = cache.lock().expect("cauchy matrix cache poisoned");
    if let Some(m) = guard.get(&key) {
        return m;
    }

    // x_i = i for i in 0..C, y_j = C + j for j in 0..D: disjoint ranges, so
    // x_i XOR y_j is never zero and every 1/(x_i xor y_j) is well defined.
    let mut matrix = Vec::with_capacity(recovery_count);
    for i in 0..recovery_count {
        let mut row = Vec::with_capacity(original_count);
        let x = i as u8;
        for j in 0..original_count {
            let y = (recovery_count + j) as u8;
            row.push(gf_inv(x ^ y));
        }
        matrix.push(row);
    }

    let leaked: &'static Vec<Vec<u8>> = Box::leak(Box::new(matrix));
    guard.insert(key, leaked);
    leaked
}

fn generator_row(index: usize, original_count: usize, recovery_count: usize) -> Vec<u8> {
    if index < original_count {
        let mut row = vec![0u8; original_count];
        row[index] = 1;
        row
    } else {
        cauchy_matrix(original_count, recovery_count)[index - original_count].clone()
    }
}

fn check_params(original_count: usize, recovery_count: usize, block_bytes: usize) -> Result<()> {
    if original_count == 0 {
        return Err(Error::BadParams("original_count must be >= 1".into()));
    }
    if original_count + recovery_count > 256 {
        return Err(Error::BadParams(
            "original_count + recovery_count must be <= 256".into(),
        ));
    }
    if block_bytes == 0 || block_bytes % 64 != 0 {
        return Err(Error::BadParams(
            "block_bytes must be a nonzero multiple of 64".into(),
        ));
    }
    Ok(())
}

/// Produces `recovery_count` parity blocks from `original_count` data blocks.
/// Deterministic: identical inputs yield byte-identical recovery blocks.
pub fn encode(
    data_blocks: &[&[u8]],
    original_count: usize,
    recovery_count: usize,
) -> Result<Vec<Vec<u8>>> {
    if data_blocks.is_empty() {
        return Err(Error::BadParams("no data blocks supplied".into()));
    }
    let block_bytes = data_blocks[0].len();
    check_params(original_count, recovery_count, block_bytes)?;
    if data_blocks.len() != original_count {
        return Err(Error::BadParams(format!(
            "expected {original_count} data blocks, got {}",
            data_blocks.len()
        )));
    }
    for b in data_blocks {
        if b.len() != block_bytes {
            return Err(Error::BadParams("data blocks must be equal length".into()));
        }
    }

    if recovery_count == 0 {
        return Ok(Vec::new());
    }

    let matrix = cauchy_matrix(original_count, recovery_count);
    let mut out = Vec::with_capacity(recovery_count);
    for row in matrix.iter() {
        let mut parity = vec![0u8; block_bytes];
        for (j, coeff) in row.iter().enumerate() {
            if *coeff == 0 {
                continue;
            }
            let src = data_blocks[j];
            for k in 0..block_bytes {
                parity[k] ^= gf_mul(*coeff, src[k]);
            }
        }
        out.push(parity);
    }
    Ok(out)
}

/// Recovers original data blocks from any `original_count` valid blocks
/// (data or code). `blocks.len()` must equal `original_count`; on success
/// `blocks[i]` holds the original data for column `i` and `blocks[i].index`
/// is normalized to `i`.
pub fn decode(blocks: &mut [Block], original_count: usize, recovery_count: usize) -> Result<()> {
    if blocks.is_empty() {
        return Err(Error::InsufficientBlocks {
            have: 0,
            need: original_count,
        });
    }
    let block_bytes = blocks[0].data.len();
    check_params(original_count, recovery_count, block_bytes)?;

    if blocks.len() < original_count {
        return Err(Error::InsufficientBlocks {
            have: blocks.len(),
            need: original_count,
        });
    }
    if blocks.len() > original_count {
        return Err(Error::BadParams(format!(
            "expected exactly {original_count} blocks, got {}",
            blocks.len()
        )));
    }
    for b in blocks.iter() {
        if b.data.len() != block_bytes {
            return Err(Error::BadParams("blocks must be equal length".into()));
        }
        if b.index >= original_count + recovery_count {
            return Err(Error::BadParams(format!(
                "block index {} out of range",
                b.index
            )));
        }
    }

    // Already all original columns present and in place: nothing to do.
    if blocks.iter().enumerate().all(|(i, b)| b.index == i) {
        return Ok(());
    }

    let d = original_count;
    let mut matrix: Vec<Vec<u8>> = blocks
        .iter()
        .map(|b| generator_row(b.index, original_count, recovery_count))
        .collect();

    let inverse = invert(&mut matrix, d)
        .ok_or_else(|| Error::BadParams("generator submatrix is singular".into()))?;

    let mut recovered = vec![vec![0u8; block_bytes]; d];
    for t in 0..d {
        for (j, block) in blocks.iter().enumerate() {
            let coeff = inverse[t][j];
            if coeff == 0 {
                continue;
            }
            for k in 0..block_bytes {
                recovered[t][k] ^= gf_mul(coeff, block.data[k]);
            }
        }
    }

    for (t, row) in recovered.into_iter().enumerate() {
        blocks[t].index = t;
        blocks[t].data = row;
    }

    Ok(())
}

/// Gauss–Jordan inversion of a `d x d` GF(256) matrix, in place on a working
/// copy; returns `None` if the matrix is singular.
fn invert(matrix: &mut [Vec<u8>], d: usize) -> Option<Vec<Vec<u8>>> {
    let mut aug: Vec<Vec<u8>> = (0..d)
        .map(|i| {
            let mut row = matrix[i].clone();
            row.resize(2 * d, 0);
            row[d + i] = 1;
            row
        })
        .collect();

    for col in 0..d {
        let pivot = (col..d).find(|&r| aug[r][col] != 0)?;
        aug.swap(col, pivot);

        let inv = gf_inv(aug[col][col]);
        for v in aug[col].iter_mut() {
            *v = gf_mul(*v, inv);
        }

        for r in 0..d {
            if r == col {
                continue;
            }
            let factor = aug[r][col];
            if factor == 0 {
                continue;
            }
            for c in 0..2 * d {
                aug[r][c] ^= gf_mul(factor, aug[col][c]);
            }
        }
    }

    Some(aug.into_iter().map(|row| row[d..].to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_no_loss() {
        let d = 4;
        let c = 2;
        let block = 64;
        let data: Vec<Vec<u8>> = (0..d)
            .map(|i| vec![(i * 7 + 1) as u8; block])
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let code = encode(&refs, d, c).unwrap();

        let mut blocks: Vec<Block> = (0..d)
            .map(|i| Block::new(i, data[i].clone()))
            .collect();
        decode(&mut blocks, d, c).unwrap();
        for i in 0..d {
            assert_eq!(blocks[i].data, data[i]);
        }
        assert_eq!(code.len(), c);
    }

    #[test]
    fn decode_recovers_from_single_data_loss() {
        let d = 4;
        let c = 2;
        let block = 64;
        let data: Vec<Vec<u8>> = (0..d).map(|i| vec![(i * 3 + 5) as u8; block]).collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let code = encode(&refs, d, c).unwrap();

        // Column 2 is missing; substitute code column 0 (global index d+0).
        let mut blocks = vec![
            Block::new(0, data[0].clone()),
            Block::new(1, data[1].clone()),
            Block::new(d, code[0].clone()),
            Block::new(3, data[3].clone()),
        ];
        decode(&mut blocks, d, c).unwrap();
        assert_eq!(blocks[2].data, data[2]);
        assert_eq!(blocks[2].index, 2);
    }

    #[test]
    fn decode_recovers_from_two_losses_using_both_code_columns() {
        let d = 4;
        let c = 2;
        let block = 32;
        let data: Vec<Vec<u8>> = (0..d).map(|i| vec![(i * 11 + 2) as u8; block]).collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let code = encode(&refs, d, c).unwrap();

        // Columns 2 and 3 missing; fill with both code columns.
        let mut blocks = vec![
            Block::new(0, data[0].clone()),
            Block::new(1, data[1].clone()),
            Block::new(d, code[0].clone()),
            Block::new(d + 1, code[1].clone()),
        ];
        decode(&mut blocks, d, c).unwrap();
        assert_eq!(blocks[2].data, data[2]);
        assert_eq!(blocks[3].data, data[3]);
    }

    #[test]
    fn insufficient_blocks_errors() {
        let mut blocks = vec![Block::new(0, vec![0u8; 64]), Block::new(1, vec![0u8; 64])];
        let err = decode(&mut blocks, 4, 2).unwrap_err();
        assert!(matches!(err, Error::InsufficientBlocks { .. }));
    }

    #[test]
    fn bad_params_reject_zero_original_count() {
        let refs: Vec<&[u8]> = vec![];
        let err = encode(&refs, 0, 2).unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
    }

    #[test]
    fn encode_is_deterministic() {
        let d = 3;
        let c = 2;
        let block = 16;
        let data: Vec<Vec<u8>> = (0..d).map(|i| vec![(i * 17) as u8; block]).collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let a = encode(&refs, d, c).unwrap();
        let b = encode(&refs, d, c).unwrap();
        assert_eq!(a, b);
    }
}

//! CRC-32C folding of key prefixes
//!
//! A fold is the 32-bit fingerprint stored in the hash index: CRC-32C
//! seeded with the index id, then chained over the first `n_fields`
//! complete fields and the first `n_bytes` of the following field.
//! Records and tuples are folded by the identical walk, so a tuple that
//! matches a record on those positions folds to the same value.
//!
//! NULL handling depends on the row format: the compact format skips NULL
//! fields, the redundant format folds a zeroed placeholder of the
//! column's fixed length.

use crate::dict::IndexMeta;
use crate::record::{RowFormat, Tuple};

const ZEROES: [u8; 256] = [0u8; 256];

/// Fold seed derived from the index id
#[inline]
pub fn fold_seed(index_id: u64) -> u32 {
    crc32c::crc32c(&index_id.to_le_bytes())
}

fn fold_null(fold: u32, index: &IndexMeta, col: usize, limit: Option<usize>) -> u32 {
    match index.row_format {
        RowFormat::Compact => fold,
        RowFormat::Redundant => {
            let mut len = index.cols[col].fixed_len as usize;
            if let Some(limit) = limit {
                len = len.min(limit);
            }
            let mut fold = fold;
            while len > 0 {
                let chunk = len.min(ZEROES.len());
                fold = crc32c::crc32c_append(fold, &ZEROES[..chunk]);
                len -= chunk;
            }
            fold
        }
    }
}

/// Fold the `(n_fields, n_bytes)` prefix of a sequence of fields.
///
/// The sequence must contain at least `n_fields + (n_bytes > 0)` fields;
/// callers check that against the tuple or the page before folding.
pub fn fold_fields(
    index: &IndexMeta,
    fields: &[Option<&[u8]>],
    n_fields: u16,
    n_bytes: u16,
) -> u32 {
    debug_assert!(n_fields > 0 || n_bytes > 0);
    debug_assert!(fields.len() >= n_fields as usize + usize::from(n_bytes > 0));

    let mut fold = fold_seed(index.id);
    for (i, field) in fields.iter().take(n_fields as usize).enumerate() {
        match field {
            Some(data) => fold = crc32c::crc32c_append(fold, data),
            None => fold = fold_null(fold, index, i, None),
        }
    }
    if n_bytes > 0 {
        let i = n_fields as usize;
        match fields[i] {
            Some(data) => {
                let len = (n_bytes as usize).min(data.len());
                fold = crc32c::crc32c_append(fold, &data[..len]);
            }
            None => fold = fold_null(fold, index, i, Some(n_bytes as usize)),
        }
    }
    fold
}

/// Fold a tuple under the given signature prefix
pub fn fold_tuple(tuple: &Tuple, index: &IndexMeta, n_fields: u16, n_bytes: u16) -> u32 {
    let fields: Vec<Option<&[u8]>> = tuple.iter().collect();
    fold_fields(index, &fields, n_fields, n_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{ColMeta, Dictionary};
    use crate::record::RowFormat;
    use std::sync::Arc;

    fn index(row_format: RowFormat) -> Arc<IndexMeta> {
        let dict = Dictionary::new();
        let table = dict.create_table("t");
        dict.create_index(
            &table,
            "pk",
            2,
            vec![ColMeta::new(8, true), ColMeta::new(8, true)],
            row_format,
        )
    }

    #[test]
    fn test_tuple_and_fields_fold_equal() {
        let index = index(RowFormat::Compact);
        let tuple = Tuple::new(vec![Some(b"hello".to_vec()), Some(b"world".to_vec())]);
        let fields = [Some(b"hello".as_slice()), Some(b"world".as_slice())];
        assert_eq!(
            fold_tuple(&tuple, &index, 2, 0),
            fold_fields(&index, &fields, 2, 0)
        );
    }

    #[test]
    fn test_partial_field_fold() {
        let index = index(RowFormat::Compact);
        let a = [Some(b"abcdef".as_slice())];
        let b = [Some(b"abcxyz".as_slice())];
        // First three bytes agree, so the 3-byte folds agree
        assert_eq!(fold_fields(&index, &a, 0, 3), fold_fields(&index, &b, 0, 3));
        assert_ne!(fold_fields(&index, &a, 0, 4), fold_fields(&index, &b, 0, 4));
    }

    #[test]
    fn test_partial_bytes_clamped_to_field_len() {
        let index = index(RowFormat::Compact);
        let a = [Some(b"ab".as_slice())];
        // Asking for more bytes than the field has folds the whole field
        assert_eq!(fold_fields(&index, &a, 0, 9), fold_fields(&index, &a, 0, 2));
    }

    #[test]
    fn test_null_skipped_in_compact() {
        let index = index(RowFormat::Compact);
        let with_null = [None, Some(b"x".as_slice())];
        let just_x = [Some(b"x".as_slice())];
        // A NULL field contributes nothing in the compact format
        assert_eq!(
            fold_fields(&index, &with_null, 2, 0),
            fold_fields(&index, &just_x, 1, 0)
        );
    }

    #[test]
    fn test_null_zero_placeholder_in_redundant() {
        let index = index(RowFormat::Redundant);
        let with_null = [None];
        let zeroes = [0u8; 8];
        let explicit = [Some(zeroes.as_slice())];
        assert_eq!(
            fold_fields(&index, &with_null, 1, 0),
            fold_fields(&index, &explicit, 1, 0)
        );
    }

    #[test]
    fn test_seed_distinguishes_indexes() {
        assert_ne!(fold_seed(1), fold_seed(2));
    }
}

use candle_core::{DType, Tensor};

use crate::error::{EncoderError, Result};

/// Check the recurrent-encoder preconditions and return the lengths as host integers.
///
/// `embed_src` must be `(batch, max_len, emb_size)`, `src_length` rank 1 with one entry per
/// batch element, each length in `1..=max_len` and the batch sorted by descending length.
/// An empty batch or zero-length padding axis is rejected.
pub(crate) fn check_recurrent_inputs(
    embed_src: &Tensor,
    src_length: &Tensor,
    emb_size: usize,
) -> Result<Vec<usize>> {
    if embed_src.rank() != 3 {
        return Err(EncoderError::shape(
            "embed_src rank",
            3,
            format!("{:?}", embed_src.dims()),
        ));
    }
    if src_length.rank() != 1 {
        return Err(EncoderError::shape(
            "src_length rank",
            1,
            format!("{:?}", src_length.dims()),
        ));
    }
    let (batch, max_len, dim) = embed_src.dims3()?;
    if batch == 0 || max_len == 0 {
        return Err(EncoderError::shape(
            "embed_src",
            "at least one sequence of at least one step",
            format!("{:?}", embed_src.dims()),
        ));
    }
    if src_length.dim(0)? != batch {
        return Err(EncoderError::shape(
            "batch size of src_length",
            batch,
            src_length.dim(0)?,
        ));
    }
    if dim != emb_size {
        return Err(EncoderError::shape("embedding size", emb_size, dim));
    }

    let lengths: Vec<usize> = src_length
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|l| l as usize)
        .collect();
    for (i, &len) in lengths.iter().enumerate() {
        if len == 0 || len > max_len {
            return Err(EncoderError::shape(
                "src_length entry",
                format!("1..={max_len}"),
                format!("{len} at index {i}"),
            ));
        }
    }
    if lengths.windows(2).any(|w| w[0] < w[1]) {
        return Err(EncoderError::shape(
            "src_length order",
            "descending",
            format!("{lengths:?}"),
        ));
    }
    Ok(lengths)
}

/// Validate a `(batch, 1, len)` mask against the embeddings and drop the singleton axis.
pub(crate) fn squeeze_mask(mask: &Tensor, embed_src: &Tensor) -> Result<Tensor> {
    let (batch, len, _) = embed_src.dims3()?;
    match mask.dims() {
        &[b, 1, t] if b == batch && t == len => Ok(mask.squeeze(1)?),
        dims => Err(EncoderError::shape(
            "mask",
            format!("[{batch}, 1, {len}]"),
            format!("{dims:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn embeddings(b: usize, t: usize, d: usize) -> Tensor {
        Tensor::zeros((b, t, d), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn accepts_sorted_lengths() {
        let lengths = Tensor::new(&[5u32, 3], &Device::Cpu).unwrap();
        let out = check_recurrent_inputs(&embeddings(2, 5, 8), &lengths, 8).unwrap();
        assert_eq!(out, vec![5, 3]);
    }

    #[test]
    fn rejects_unsorted_or_out_of_range_lengths() {
        let unsorted = Tensor::new(&[3u32, 5], &Device::Cpu).unwrap();
        assert!(check_recurrent_inputs(&embeddings(2, 5, 8), &unsorted, 8).is_err());
        let too_long = Tensor::new(&[6u32, 3], &Device::Cpu).unwrap();
        assert!(check_recurrent_inputs(&embeddings(2, 5, 8), &too_long, 8).is_err());
    }

    #[test]
    fn rejects_empty_batch_and_empty_time_axis() {
        let no_lengths = Tensor::zeros(0, DType::U32, &Device::Cpu).unwrap();
        let err = check_recurrent_inputs(&embeddings(0, 5, 8), &no_lengths, 8).unwrap_err();
        assert!(err.to_string().contains("embed_src"));
        let zero = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(check_recurrent_inputs(&embeddings(1, 0, 8), &zero, 8).is_err());
    }

    #[test]
    fn rejects_rank_two_lengths() {
        let lengths = Tensor::new(&[[5u32], [3]], &Device::Cpu).unwrap();
        let err = check_recurrent_inputs(&embeddings(2, 5, 8), &lengths, 8).unwrap_err();
        assert!(err.to_string().contains("src_length rank"));
    }

    #[test]
    fn mask_must_have_singleton_middle_axis() {
        let emb = embeddings(2, 5, 8);
        let good = Tensor::ones((2, 1, 5), DType::U8, &Device::Cpu).unwrap();
        assert_eq!(squeeze_mask(&good, &emb).unwrap().dims(), &[2, 5]);
        let flat = Tensor::ones((2, 5), DType::U8, &Device::Cpu).unwrap();
        assert!(squeeze_mask(&flat, &emb).is_err());
    }
}

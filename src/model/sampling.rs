//! Next-token selection from raw logits.

use std::cmp::Ordering;

use rand::Rng;

use crate::model::SamplingParams;

/// Pick the next token id. Temperature 0 is greedy; otherwise logits are
/// temperature-scaled, restricted to the top-k candidates and then to the
/// smallest prefix whose mass exceeds `top_p`, and sampled.
pub fn sample_next<R: Rng + ?Sized>(logits: &[f32], params: &SamplingParams, rng: &mut R) -> u32 {
    if logits.is_empty() {
        return 0;
    }
    if params.temperature <= f32::EPSILON {
        return argmax(logits);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .filter(|(_, logit)| logit.is_finite())
        .map(|(i, &logit)| (i, logit / params.temperature))
        .collect();
    if candidates.is_empty() {
        return argmax(logits);
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    candidates.truncate((params.top_k as usize).max(1));

    // Softmax over the surviving candidates.
    let max = candidates[0].1;
    let mut total = 0.0f32;
    for candidate in candidates.iter_mut() {
        candidate.1 = (candidate.1 - max).exp();
        total += candidate.1;
    }
    for candidate in candidates.iter_mut() {
        candidate.1 /= total;
    }

    if params.top_p < 1.0 {
        let mut cumsum = 0.0;
        let mut keep = candidates.len();
        for (idx, (_, prob)) in candidates.iter().enumerate() {
            cumsum += prob;
            if cumsum > params.top_p {
                keep = idx + 1;
                break;
            }
        }
        candidates.truncate(keep.max(1));
    }

    let mass: f32 = candidates.iter().map(|(_, p)| p).sum();
    let sample = rng.gen_range(0.0..mass.max(f32::MIN_POSITIVE));
    let mut cumsum = 0.0;
    for (id, prob) in &candidates {
        cumsum += prob;
        if cumsum > sample {
            return *id as u32;
        }
    }
    candidates.last().map(|(id, _)| *id as u32).unwrap_or(0)
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

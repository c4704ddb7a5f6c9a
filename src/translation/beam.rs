/**
 * Beam search over an encoder-decoder model.
 *
 * Scores are summed log-probabilities. A hypothesis that ends in `</s>` is
 * scored by `sum / (len - 1)`: length penalty 1.0 over everything after
 * decoder_start, the forced language token included. Search stops as soon
 * as `num_beams` hypotheses have finished. Ties are broken by beam index
 * and then token id, so identical inputs always give identical output.
 */
use std::cmp::Ordering;

use crate::error::{Result, RuntimeError};
use crate::runtime::model::{EncoderState, Seq2SeqModel};

pub const NO_REPEAT_NGRAM_SIZE: usize = 3;

/// Score given to padding rows so they never produce a candidate.
const DEAD_BEAM_SCORE: f32 = -1.0e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamConfig {
    pub num_beams: usize,
    /// Upper bound on the decoder sequence, prompt included.
    pub max_length: usize,
    pub eos_token_id: i64,
    pub no_repeat_ngram_size: usize,
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<i64>,
    score: f32,
}

impl Beam {
    fn is_alive(&self) -> bool {
        self.score > DEAD_BEAM_SCORE / 2.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: i64,
    score: f32,
}

/// Higher score first, then lower beam index, then lower token id.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.beam.cmp(&b.beam))
        .then(a.token.cmp(&b.token))
}

#[derive(Debug, Clone)]
struct Finished {
    tokens: Vec<i64>,
    score: f32,
}

/// In-place log-softmax. Rows that are entirely `-inf` stay that way.
pub fn log_softmax(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let sum: f32 = logits.iter().map(|&x| (x - max).exp()).sum();
    let log_sum = sum.ln() + max;
    for x in logits.iter_mut() {
        *x -= log_sum;
    }
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn banned_ngram_tokens(tokens: &[i64], n: usize) -> Vec<i64> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }
    if n == 1 {
        return tokens.to_vec();
    }

    let prefix = &tokens[tokens.len() + 1 - n..];
    tokens
        .windows(n)
        .filter(|window| &window[..n - 1] == prefix)
        .map(|window| window[n - 1])
        .collect()
}

/// Top `k` candidates of one beam, in rank order.
fn top_candidates(beam: usize, base: f32, logprobs: &[f32], k: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(token, &lp)| Candidate {
            beam,
            token: token as i64,
            score: base + lp,
        })
        .collect();

    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, rank);
        candidates.truncate(k);
    }
    candidates.sort_by(rank);
    candidates
}

/// Run beam search from `prompt` and return the generated tokens (prompt excluded).
///
/// `state` must have been encoded with `config.num_beams` rows.
pub fn beam_search(
    model: &dyn Seq2SeqModel,
    state: &EncoderState,
    prompt: &[i64],
    config: &BeamConfig,
) -> Result<Vec<i64>> {
    let num_beams = config.num_beams.max(1);
    if state.batch() != num_beams {
        return Err(RuntimeError::inference(format!(
            "encoder batch {} does not match {num_beams} beams",
            state.batch()
        )));
    }
    if prompt.len() >= config.max_length {
        return Ok(Vec::new());
    }

    let eos = config.eos_token_id;
    let per_beam = 2 * num_beams;

    // Only the first row is live at the start; the others are identical copies.
    let mut beams: Vec<Beam> = (0..num_beams)
        .map(|i| Beam {
            tokens: prompt.to_vec(),
            score: if i == 0 { 0.0 } else { DEAD_BEAM_SCORE },
        })
        .collect();
    let mut finished: Vec<Finished> = Vec::new();
    // Only decoder_start counts as prompt; the forced language token is scored.
    let generated_len = |tokens: &[i64]| (tokens.len() - 1).max(1) as f32;

    let mut cur_len = prompt.len();
    while cur_len < config.max_length {
        let rows: Vec<Vec<i64>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let logits = model.next_token_logits(state, &rows)?;
        if logits.len() != num_beams {
            return Err(RuntimeError::inference(format!(
                "model returned {} logit rows for {num_beams} beams",
                logits.len()
            )));
        }

        let force_eos = cur_len + 1 == config.max_length;
        let mut candidates = Vec::with_capacity(per_beam * num_beams);
        for (index, (beam, mut row)) in beams.iter().zip(logits).enumerate() {
            if !beam.is_alive() {
                continue;
            }
            let eos_index = usize::try_from(eos)
                .ok()
                .filter(|&i| i < row.len())
                .ok_or_else(|| RuntimeError::inference(format!("eos id {eos} outside vocabulary")))?;

            log_softmax(&mut row);
            for token in banned_ngram_tokens(&beam.tokens, config.no_repeat_ngram_size) {
                if let Some(lp) = usize::try_from(token).ok().and_then(|t| row.get_mut(t)) {
                    *lp = f32::NEG_INFINITY;
                }
            }
            if force_eos {
                row.iter_mut().for_each(|lp| *lp = f32::NEG_INFINITY);
                row[eos_index] = 0.0;
            }

            candidates.extend(top_candidates(index, beam.score, &row, per_beam));
        }
        candidates.sort_by(rank);
        candidates.truncate(per_beam);

        let mut next: Vec<Beam> = Vec::with_capacity(num_beams);
        for (position, candidate) in candidates.iter().enumerate() {
            let mut tokens = beams[candidate.beam].tokens.clone();
            tokens.push(candidate.token);

            if candidate.token == eos {
                // A finished hypothesis only counts if it made the top `num_beams`.
                if position < num_beams {
                    let score = candidate.score / generated_len(&tokens);
                    finished.push(Finished { tokens, score });
                }
            } else {
                next.push(Beam {
                    tokens,
                    score: candidate.score,
                });
            }

            if next.len() == num_beams {
                break;
            }
        }

        if finished.len() >= num_beams || next.is_empty() {
            break;
        }

        while next.len() < num_beams {
            let mut filler = next[0].clone();
            filler.score = DEAD_BEAM_SCORE;
            next.push(filler);
        }
        beams = next;
        cur_len += 1;
    }

    if finished.is_empty() {
        finished = beams
            .into_iter()
            .filter(Beam::is_alive)
            .map(|beam| Finished {
                score: beam.score / generated_len(&beam.tokens),
                tokens: beam.tokens,
            })
            .collect();
    }

    let best = finished
        .into_iter()
        .reduce(|best, hyp| if hyp.score > best.score { hyp } else { best })
        .ok_or_else(|| RuntimeError::inference("beam search produced no hypothesis"))?;

    Ok(best.tokens[prompt.len()..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_utils::ClosureModel;

    const EOS: i64 = 2;
    const A: i64 = 3;
    const B: i64 = 4;
    const C: i64 = 5;
    const D: i64 = 6;
    const E: i64 = 7;
    const PROMPT: [i64; 2] = [0, 1];

    fn probs(pairs: &[(i64, f32)]) -> Vec<f32> {
        let mut logits = vec![(1e-6f32).ln(); 8];
        for &(token, p) in pairs {
            logits[token as usize] = p.ln();
        }
        logits
    }

    fn search(model: &dyn Seq2SeqModel, num_beams: usize, max_length: usize) -> Vec<i64> {
        let state = model.encode(&[10, 11, EOS], num_beams).unwrap();
        let config = BeamConfig {
            num_beams,
            max_length,
            eos_token_id: EOS,
            no_repeat_ngram_size: NO_REPEAT_NGRAM_SIZE,
        };
        beam_search(model, &state, &PROMPT, &config).unwrap()
    }

    /// Greedy takes A, but B followed by </s> is the more likely sentence.
    fn garden_path(row: &[i64]) -> Vec<f32> {
        match (row.len(), row.last().copied()) {
            (2, _) => probs(&[(A, 0.5), (B, 0.45)]),
            (3, Some(A)) => probs(&[(EOS, 0.25), (C, 0.25), (D, 0.25), (E, 0.25)]),
            (3, Some(B)) => probs(&[(EOS, 0.9), (C, 0.1)]),
            _ => probs(&[(EOS, 1.0)]),
        }
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let mut row = vec![1.0, 2.0, 3.0];
        log_softmax(&mut row);
        let total: f32 = row.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(row[2] > row[1] && row[1] > row[0]);
    }

    #[test]
    fn test_banned_ngram_tokens() {
        assert_eq!(banned_ngram_tokens(&[1, 2, 3, 1, 2], 3), vec![3]);
        assert_eq!(banned_ngram_tokens(&[1, 2, 3, 1, 2, 4, 1, 2], 3), vec![3, 4]);
        assert!(banned_ngram_tokens(&[1, 2], 3).is_empty());
        assert!(banned_ngram_tokens(&[1, 2, 3], 0).is_empty());
    }

    #[test]
    fn test_beam_finds_better_sequence_than_greedy() {
        let model = ClosureModel::new(garden_path);
        assert_eq!(search(&model, 1, 10), vec![A, EOS]);
        assert_eq!(search(&model, 2, 10), vec![B, EOS]);
    }

    #[test]
    fn test_length_penalty_counts_language_token() {
        // [lang, </s>] scores ln(0.174) / 2, [lang, A, </s>] scores ln(0.498 * 0.1) / 3.
        // Dividing by the tokens after the language marker alone would flip the winner.
        fn spread(pairs: &[(i64, f32)]) -> Vec<f32> {
            let rest: f32 = 1.0 - pairs.iter().map(|&(_, p)| p).sum::<f32>();
            let mut logits = vec![(rest.max(1e-9) / 64.0).ln(); 64];
            for &(token, p) in pairs {
                logits[token as usize] = p.ln();
            }
            logits
        }
        let model = ClosureModel::new(|row: &[i64]| match (row.len(), row.last().copied()) {
            (2, _) => spread(&[(EOS, 0.174), (A, 0.498)]),
            (3, Some(A)) => spread(&[(D, 0.9), (EOS, 0.1)]),
            _ => spread(&[(EOS, 1.0)]),
        });
        assert_eq!(search(&model, 2, 10), vec![EOS]);
    }

    #[test]
    fn test_no_trigram_repeats() {
        // Wants to alternate A B A B ... forever.
        let model = ClosureModel::new(|row: &[i64]| {
            let mut logits = vec![0.0f32; 8];
            logits[EOS as usize] = -5.0;
            let favourite = if row.last() == Some(&A) { B } else { A };
            logits[favourite as usize] = 5.0;
            logits
        });

        let output = search(&model, 2, 16);
        let mut sequence = PROMPT.to_vec();
        sequence.extend(&output);

        let mut seen = std::collections::HashSet::new();
        for trigram in sequence.windows(3) {
            assert!(seen.insert(trigram.to_vec()), "repeated trigram {trigram:?} in {sequence:?}");
        }
    }

    #[test]
    fn test_eos_forced_at_max_length() {
        let model = ClosureModel::new(|_: &[i64]| {
            let mut logits = vec![0.0f32; 8];
            logits[EOS as usize] = -50.0;
            logits
        });

        let output = search(&model, 3, 6);
        assert_eq!(output.len(), 6 - PROMPT.len());
        assert_eq!(output.last(), Some(&EOS));
    }

    #[test]
    fn test_identical_inputs_identical_outputs() {
        let model = ClosureModel::new(garden_path);
        assert_eq!(search(&model, 4, 12), search(&model, 4, 12));
    }

    #[test]
    fn test_batch_mismatch_is_inference_error() {
        let model = ClosureModel::new(garden_path);
        let state = model.encode(&[10, EOS], 1).unwrap();
        let config = BeamConfig {
            num_beams: 4,
            max_length: 8,
            eos_token_id: EOS,
            no_repeat_ngram_size: NO_REPEAT_NGRAM_SIZE,
        };
        assert!(matches!(
            beam_search(&model, &state, &PROMPT, &config),
            Err(RuntimeError::Inference(_))
        ));
    }
}

//! Small helpers for classification datasets.

use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

/// Type alias for a dataset split: (train_inputs, train_targets, test_inputs, test_targets).
pub type Split = (
    Vec<Vec<Vec<f64>>>,
    Vec<Vec<Vec<f64>>>,
    Vec<Vec<Vec<f64>>>,
    Vec<Vec<Vec<f64>>>,
);

/// Index of the largest value; the first one wins ties. NaN is never picked.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_v = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_v {
            best = i;
            best_v = v;
        }
    }
    best
}

/// Share of samples whose output argmax equals the target argmax.
pub fn compute_accuracy<T: Scalar>(
    network: &mut Network<T>,
    inputs: &[Vec<Vec<f64>>],
    targets: &[Vec<Vec<f64>>],
) -> Result<f64> {
    if inputs.len() != targets.len() {
        return Err(NetError::config(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }
    if inputs.is_empty() {
        return Ok(0.0);
    }
    let mut correct = 0usize;
    for (x, y) in inputs.iter().zip(targets) {
        network.forward(x)?;
        let out: Vec<f64> = network.output_grid().into_iter().flatten().collect();
        let want: Vec<f64> = y.iter().flatten().copied().collect();
        if argmax(&out) == argmax(&want) {
            correct += 1;
        }
    }
    Ok(correct as f64 / inputs.len() as f64)
}

/// First `fraction` of the samples for training, the rest for testing. Order is kept.
pub fn split_dataset(inputs: &[Vec<Vec<f64>>], targets: &[Vec<Vec<f64>>], fraction: f64) -> Result<Split> {
    if inputs.len() != targets.len() {
        return Err(NetError::config(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }
    if !(0.0..=1.0).contains(&fraction) {
        return Err(NetError::config(format!("split fraction {fraction} is outside [0, 1]")));
    }
    let cut = ((inputs.len() as f64) * fraction).round() as usize;
    Ok((
        inputs[..cut].to_vec(),
        targets[..cut].to_vec(),
        inputs[cut..].to_vec(),
        targets[cut..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[f64::NAN, -1.0]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn split_keeps_order() {
        let xs: Vec<Vec<Vec<f64>>> = (0..10).map(|i| vec![vec![i as f64]]).collect();
        let (tx, ty, vx, vy) = split_dataset(&xs, &xs, 0.8).unwrap();
        assert_eq!((tx.len(), ty.len(), vx.len(), vy.len()), (8, 8, 2, 2));
        assert_eq!(vx[0][0][0], 8.0);
        assert!(split_dataset(&xs, &xs, 1.5).is_err());
        assert!(split_dataset(&xs, &xs[..3], 0.5).is_err());
    }

    #[test]
    fn accuracy_of_identity_network() {
        let mut n: Network<f32> =
            Network::create(&[(2, 1), (2, 1)], &[Activation::Linear; 2], &[true; 2], None).unwrap();
        n.set_weight(1, 0, 0, 0, 1.0).unwrap();
        n.set_weight(1, 0, 0, 1, 0.0).unwrap();
        n.set_weight(1, 1, 0, 0, 0.0).unwrap();
        n.set_weight(1, 1, 0, 1, 1.0).unwrap();
        let inputs = vec![vec![vec![1.0, 0.0]], vec![vec![0.0, 1.0]]];
        let targets = vec![vec![vec![1.0, 0.0]], vec![vec![1.0, 0.0]]];
        assert_eq!(compute_accuracy(&mut n, &inputs, &targets).unwrap(), 0.5);
    }
}

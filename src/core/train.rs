//! Epoch loop over a dataset, and training several networks at once.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};

use crate::backward::ClipRange;
use crate::config::TrainConfig;
use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

/// Mean loss per epoch, measured on each sample before its update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub epoch_loss: Vec<f64>,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_loss.last().copied()
    }
}

impl<T: Scalar> Network<T> {
    /// Forward + backward per sample per epoch, optionally shuffling with the
    /// network's PRNG.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &mut self,
        inputs: &[Vec<Vec<f64>>],
        targets: &[Vec<Vec<f64>>],
        epochs: usize,
        lr: f64,
        shuffle: bool,
        clip_upper: T,
        clip_lower: T,
    ) -> Result<TrainReport> {
        self.train_loop(inputs, targets, epochs, lr, shuffle, clip_upper, clip_lower, false)
    }

    /// [`train`](Network::train) driven by a [`TrainConfig`].
    pub fn train_with(
        &mut self,
        inputs: &[Vec<Vec<f64>>],
        targets: &[Vec<Vec<f64>>],
        config: &TrainConfig,
    ) -> Result<TrainReport> {
        config.validate()?;
        let clip = ClipRange::<T>::new(config.clip_lower, config.clip_upper)?;
        self.train_loop(
            inputs,
            targets,
            config.epochs,
            config.learning_rate,
            config.shuffle,
            clip.upper,
            clip.lower,
            config.debug,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn train_loop(
        &mut self,
        inputs: &[Vec<Vec<f64>>],
        targets: &[Vec<Vec<f64>>],
        epochs: usize,
        lr: f64,
        shuffle: bool,
        clip_upper: T,
        clip_lower: T,
        verbose: bool,
    ) -> Result<TrainReport> {
        if inputs.len() != targets.len() {
            return Err(NetError::config(format!(
                "{} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        if clip_lower > clip_upper {
            return Err(NetError::config(format!(
                "clip lower bound {clip_lower} exceeds upper bound {clip_upper}"
            )));
        }
        for (x, y) in inputs.iter().zip(targets) {
            self.check_grid(0, x)?;
            self.check_grid(self.output_index(), y)?;
        }

        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let mut report = TrainReport::default();
        for epoch in 0..epochs {
            if shuffle {
                self.rng.shuffle(&mut order);
            }
            let mut total = 0.0;
            for &i in &order {
                self.forward(&inputs[i])?;
                total += self.compute_loss(&targets[i])?;
                self.backward(&targets[i], lr, clip_upper, clip_lower)?;
            }
            let mean = if order.is_empty() {
                0.0
            } else {
                total / order.len() as f64
            };
            if verbose {
                info!("epoch {}/{}: loss {:.6}", epoch + 1, epochs, mean);
            } else {
                debug!("epoch {}/{}: loss {:.6}", epoch + 1, epochs, mean);
            }
            report.epoch_loss.push(mean);
        }
        Ok(report)
    }
}

/// Train independent networks on the same data, concurrently with the
/// `parallel` feature and sequentially otherwise.
pub fn train_each<T: Scalar>(
    networks: &mut [Network<T>],
    inputs: &[Vec<Vec<f64>>],
    targets: &[Vec<Vec<f64>>],
    config: &TrainConfig,
) -> Vec<Result<TrainReport>> {
    #[cfg(feature = "parallel")]
    {
        networks
            .par_iter_mut()
            .map(|n| n.train_with(inputs, targets, config))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        networks
            .iter_mut()
            .map(|n| n.train_with(inputs, targets, config))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;

    fn scalar_net() -> Network<f64> {
        let mut n = Network::create(
            &[(1, 1), (1, 1), (1, 1)],
            &[Activation::Linear; 3],
            &[true; 3],
            Some(42),
        )
        .unwrap();
        n.set_weight(1, 0, 0, 0, 0.5).unwrap();
        n.set_weight(2, 0, 0, 0, 0.5).unwrap();
        n
    }

    fn line() -> (Vec<Vec<Vec<f64>>>, Vec<Vec<Vec<f64>>>) {
        let xs = [-1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0];
        let inputs = xs.iter().map(|&x| vec![vec![x]]).collect();
        let targets = xs.iter().map(|&x| vec![vec![3.0 * x - 2.0]]).collect();
        (inputs, targets)
    }

    #[test]
    fn scalar_regression_learns_line() {
        let (inputs, targets) = line();
        let mut n = scalar_net();
        let report = n.train(&inputs, &targets, 500, 0.01, false, 5.0, -5.0).unwrap();
        assert_eq!(report.epoch_loss.len(), 500);
        assert!(report.final_loss().unwrap() < report.epoch_loss[0]);
        n.forward(&[vec![3.0]]).unwrap();
        assert!((n.output()[0] - 7.0).abs() < 0.05, "got {}", n.output()[0]);
    }

    #[test]
    fn seeded_chain_fits_line_on_one_to_five() {
        let mut n = Network::<f64>::create(
            &[(1, 1), (1, 1), (1, 1)],
            &[Activation::Linear; 3],
            &[true; 3],
            Some(42),
        )
        .unwrap();
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let inputs: Vec<_> = xs.iter().map(|&x| vec![vec![x]]).collect();
        let targets: Vec<_> = xs.iter().map(|&x| vec![vec![3.0 * x - 2.0]]).collect();
        n.train(&inputs, &targets, 500, 0.01, false, 5.0, -5.0).unwrap();
        n.forward(&[vec![3.0]]).unwrap();
        assert!((n.output()[0] - 7.0).abs() < 0.05, "got {}", n.output()[0]);
    }

    #[test]
    fn train_with_rejects_out_of_range_clip() {
        let (inputs, targets) = line();
        let mut n: Network<i8> = scalar_net().convert().unwrap();
        let cfg = TrainConfig::new(1, 0.1).with_clip(-500.0, 500.0);
        let r = n.train_with(&inputs, &targets, &cfg);
        assert!(matches!(r, Err(NetError::NumericOverflow(_))));
    }

    #[test]
    fn mismatched_dataset_is_rejected() {
        let (inputs, mut targets) = line();
        targets.pop();
        let mut n = scalar_net();
        assert!(n.train(&inputs, &targets, 1, 0.1, false, 1.0, -1.0).is_err());
    }

    #[test]
    fn shuffled_training_is_reproducible() {
        let (inputs, targets) = line();
        let cfg = TrainConfig::new(20, 0.01).with_shuffle(true).with_clip(-5.0, 5.0);
        let mut a = scalar_net();
        let mut b = scalar_net();
        a.train_with(&inputs, &targets, &cfg).unwrap();
        b.train_with(&inputs, &targets, &cfg).unwrap();
        assert!(a.structurally_eq(&b));
    }

    #[test]
    fn tagged_partitions_learn_independently() {
        // partition 0 reads columns 0 and 2, partition 1 reads 1 and 3
        let mut n = Network::<f64>::create(&[(4, 1), (2, 1)], &[Activation::Linear; 2], &[true; 2], Some(8)).unwrap();
        let samples: Vec<(Vec<Vec<f64>>, Vec<Vec<f64>>)> = (0..16u32)
            .map(|bits| {
                let x: Vec<f64> = (0..4).map(|b| f64::from((bits >> b) & 1)).collect();
                let t = vec![x[0] - x[2], x[1] + x[3]];
                (vec![x], vec![t])
            })
            .collect();
        for _ in 0..300 {
            for (x, t) in &samples {
                for k in 0..2 {
                    n.forward_tagged(x, 2, k).unwrap();
                    n.backward_tagged(t, 0.05, 2, k, 1.0, -1.0).unwrap();
                }
            }
        }
        for (x, t) in &samples {
            for k in 0..2 {
                n.forward_tagged(x, 2, k).unwrap();
                assert!((n.output()[k] - t[0][k]).abs() < 1e-3, "partition {k}");
            }
        }
    }

    #[test]
    fn train_each_trains_every_network() {
        let (inputs, targets) = line();
        let mut nets = vec![scalar_net(), scalar_net(), scalar_net()];
        let cfg = TrainConfig::new(50, 0.01).with_clip(-5.0, 5.0);
        let reports = train_each(&mut nets, &inputs, &targets, &cfg);
        assert_eq!(reports.len(), 3);
        for r in reports {
            let r = r.unwrap();
            assert!(r.final_loss().unwrap() < r.epoch_loss[0]);
        }
        assert!(nets[0].structurally_eq(&nets[2]));
    }
}

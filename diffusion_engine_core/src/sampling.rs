use candle_core::{Result, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

/// What a runtime hands the step callback after each denoising step.
#[derive(Clone, Copy, Debug)]
pub struct StepState<'a> {
    pub step: usize,
    pub total_steps: usize,
    pub latents: Option<&'a Tensor>,
}

/// Returned by a step callback to keep going or stop the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Interrupt,
}

/// Invoked once per completed denoising step.
pub trait StepCallback {
    fn on_step(&mut self, state: &StepState<'_>) -> StepControl;
}

impl<F> StepCallback for F
where
    F: FnMut(&StepState<'_>) -> StepControl,
{
    fn on_step(&mut self, state: &StepState<'_>) -> StepControl {
        self(state)
    }
}

#[derive(Debug)]
pub enum DenoiseOutcome {
    Completed(Tensor),
    /// Stopped by the callback after `step` completed.
    Interrupted { step: usize },
}

/// Walks a timestep schedule and reports every step to a callback.
pub struct DenoiseLoop<'a> {
    timesteps: &'a [f64],
    silent: bool,
}

impl<'a> DenoiseLoop<'a> {
    pub fn new(timesteps: &'a [f64], silent: bool) -> Self {
        Self { timesteps, silent }
    }

    pub fn total_steps(&self) -> usize {
        self.timesteps.len().saturating_sub(1)
    }

    fn progress_bar(&self) -> ProgressBar {
        if self.silent {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(self.total_steps() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{elapsed_precise}] [{wide_bar:.green}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.set_message("Denoise loop");
        bar
    }

    /// Run the denoising process over the given latents.
    ///
    /// Expects a step closure:
    /// ```ignore
    /// fn(latents: &Tensor, t_curr: f64, t_prev: f64) -> Result<Tensor>;
    /// ```
    /// returning the next latents.
    pub fn run(
        &self,
        latents: &Tensor,
        mut step: impl FnMut(&Tensor, f64, f64) -> Result<Tensor>,
        callback: &mut dyn StepCallback,
    ) -> Result<DenoiseOutcome> {
        let total_steps = self.total_steps();
        let bar = self.progress_bar();
        let mut latents = latents.clone();
        for (i, window) in self.timesteps.windows(2).enumerate() {
            let (t_curr, t_prev) = match window {
                [a, b] => (*a, *b),
                _ => continue,
            };
            latents = step(&latents, t_curr, t_prev)?;
            bar.inc(1);
            let state = StepState {
                step: i,
                total_steps,
                latents: Some(&latents),
            };
            if callback.on_step(&state) == StepControl::Interrupt {
                bar.abandon();
                return Ok(DenoiseOutcome::Interrupted { step: i });
            }
        }
        bar.finish();
        Ok(DenoiseOutcome::Completed(latents))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Result, Tensor};

    use super::{DenoiseLoop, DenoiseOutcome, StepControl, StepState};

    #[test]
    fn euler_walk_over_the_schedule() -> Result<()> {
        let timesteps = [1.0, 0.5, 0.0];
        let img = Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?;
        let mut seen = Vec::new();
        let mut cb = |s: &StepState<'_>| {
            seen.push((s.step, s.total_steps));
            StepControl::Continue
        };
        let out = DenoiseLoop::new(&timesteps, true).run(
            &img,
            |x, t_curr, t_prev| {
                let pred = Tensor::ones_like(x)?;
                x + (pred * (t_prev - t_curr))?
            },
            &mut cb,
        )?;
        assert_eq!(seen, vec![(0, 2), (1, 2)]);
        let DenoiseOutcome::Completed(out) = out else {
            panic!("loop was interrupted");
        };
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![-1.0; 4]);
        Ok(())
    }

    #[test]
    fn interrupt_stops_before_the_next_step() -> Result<()> {
        let timesteps = [4., 3., 2., 1., 0.];
        let img = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let mut calls = 0;
        let mut cb = |s: &StepState<'_>| {
            if s.step == 1 {
                StepControl::Interrupt
            } else {
                StepControl::Continue
            }
        };
        let out = DenoiseLoop::new(&timesteps, true).run(
            &img,
            |x, _, _| {
                calls += 1;
                x + 1.
            },
            &mut cb,
        )?;
        assert!(matches!(out, DenoiseOutcome::Interrupted { step: 1 }));
        assert_eq!(calls, 2);
        Ok(())
    }
}

//! # DPM-Solver++ multistep scheduler
//!
//! A second-order multistep ODE solver for epsilon-predicting diffusion
//! models. Every step converts the noise prediction into an estimate of the
//! clean sample and extrapolates from the two most recent estimates, so no
//! extra model evaluations are needed for the second order.
//!
//! DPM-Solver++: Fast Solver for Guided Sampling of Diffusion Probabilistic
//! Models, C. Lu et al, 2022. https://arxiv.org/abs/2211.01095

use std::collections::VecDeque;

use sdstream_common::core::{bail, Result, Tensor};

/// The configuration for the DPM-Solver++ multistep scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DPMSolverMultistepSchedulerConfig {
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How many past clean-sample estimates a step combines. 1 or 2.
    pub solver_order: usize,
}

impl Default for DPMSolverMultistepSchedulerConfig {
    fn default() -> Self {
        Self {
            train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            solver_order: 2,
        }
    }
}

/// Noise levels of the forward process, indexed by training timestep.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sigmas: Vec<f64>,
    log_snr: Vec<f64>,
}

impl NoiseSchedule {
    /// The "scaled_linear" schedule: beta is linear in its square root.
    pub fn scaled_linear(train_timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        let betas: Vec<f64> = (0..train_timesteps)
            .map(|t| {
                let frac = if train_timesteps > 1 {
                    t as f64 / (train_timesteps - 1) as f64
                } else {
                    0.
                };
                (start + frac * (end - start)).powi(2)
            })
            .collect();

        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        for &beta in betas.iter() {
            alphas_cumprod.push((1. - beta) * alphas_cumprod.last().unwrap_or(&1f64));
        }
        let sigmas = alphas_cumprod
            .iter()
            .map(|a| ((1. - a) / a).sqrt())
            .collect();
        let log_snr = alphas_cumprod
            .iter()
            .map(|a| a.ln() - (1. - a).ln())
            .collect();

        Self {
            betas,
            alphas_cumprod,
            sigmas,
            log_snr,
        }
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// `sqrt((1 - alpha_cumprod) / alpha_cumprod)`.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// `ln(alpha_cumprod) - ln(1 - alpha_cumprod)`.
    pub fn log_snr(&self) -> &[f64] {
        &self.log_snr
    }

    /// Signal coefficient `sqrt(alpha_cumprod[t])`.
    pub fn alpha_t(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep].sqrt()
    }

    /// Noise coefficient `sqrt(1 - alpha_cumprod[t])`.
    pub fn sigma_t(&self, timestep: usize) -> f64 {
        (1. - self.alphas_cumprod[timestep]).sqrt()
    }

    /// Half log-SNR, `ln(alpha_t) - ln(sigma_t)`: the solver's time variable.
    pub fn lambda_t(&self, timestep: usize) -> f64 {
        0.5 * self.log_snr[timestep]
    }
}

/// The DPM-Solver++ multistep scheduler. One instance drives one generation.
#[derive(Debug, Clone)]
pub struct DPMSolverMultistepScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_index: usize,
    begin_index: usize,
    /// Most recent clean-sample estimates, oldest first.
    model_outputs: VecDeque<Tensor>,
    lower_order_nums: usize,
    pub config: DPMSolverMultistepSchedulerConfig,
}

impl DPMSolverMultistepScheduler {
    pub fn new(config: DPMSolverMultistepSchedulerConfig) -> Self {
        Self {
            schedule: NoiseSchedule::scaled_linear(
                config.train_timesteps,
                config.beta_start,
                config.beta_end,
            ),
            timesteps: Vec::new(),
            step_index: 0,
            begin_index: 0,
            model_outputs: VecDeque::with_capacity(config.solver_order),
            lower_order_nums: 0,
            config,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Select `num_inference_steps` timesteps with "leading" spacing, in
    /// denoising (descending) order, and reset the solver state.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train_timesteps = self.config.train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > train_timesteps {
            bail!("number of inference steps must be in 1..={train_timesteps}, got {num_inference_steps}")
        }
        let step_ratio = train_timesteps / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .map(|s| s * step_ratio)
            .rev()
            .collect();
        self.begin_index = 0;
        self.reset();
        Ok(())
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn begin_index(&self) -> usize {
        self.begin_index
    }

    /// Start denoising at `timesteps()[begin_index]`, as if no step had been taken yet.
    pub fn set_begin_index(&mut self, begin_index: usize) {
        self.begin_index = begin_index;
        self.reset();
    }

    fn reset(&mut self) {
        self.step_index = self.begin_index;
        self.model_outputs.clear();
        self.lower_order_nums = 0;
    }

    /// Forward diffusion: noise `original` up to `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        if timestep >= self.schedule.len() {
            bail!("timestep {timestep} is outside of the noise schedule")
        }
        let alpha_t = self.schedule.alpha_t(timestep);
        let sigma_t = self.schedule.sigma_t(timestep);
        (original * alpha_t)? + (noise * sigma_t)?
    }

    /// Clean-sample estimate from a noise prediction.
    fn convert_model_output(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let alpha_t = self.schedule.alpha_t(timestep);
        let sigma_t = self.schedule.sigma_t(timestep);
        (sample - (model_output * sigma_t)?)? * (1. / alpha_t)
    }

    /// Performs one backward step, returning the sample at the next timestep.
    pub fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let step_index = self.step_index;
        let Some(&expected) = self.timesteps.get(step_index) else {
            bail!(
                "scheduler stepped past its {} timesteps, call set_timesteps first",
                self.timesteps.len()
            )
        };
        if expected != timestep {
            bail!("expected timestep {expected} at step {step_index}, got {timestep}")
        }

        let x0 = self.convert_model_output(model_output, timestep, sample)?;
        if self.model_outputs.len() == self.config.solver_order.max(1) {
            self.model_outputs.pop_front();
        }
        self.model_outputs.push_back(x0.clone());

        let prev_sample = match self.timesteps.get(step_index + 1) {
            // The last step lands on the clean sample, where sigma is zero.
            None => x0,
            Some(&prev_timestep) => {
                let use_second_order = self.config.solver_order >= 2
                    && self.lower_order_nums >= 1
                    && self.model_outputs.len() >= 2
                    && step_index > self.begin_index;
                if use_second_order {
                    let last_timestep = self.timesteps[step_index - 1];
                    self.second_order_update(timestep, prev_timestep, last_timestep, sample)?
                } else {
                    self.first_order_update(&x0, timestep, prev_timestep, sample)?
                }
            }
        };

        self.step_index += 1;
        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }
        Ok(prev_sample)
    }

    /// `x_t = (sigma_t / sigma_s) * x_s - alpha_t * (exp(-h) - 1) * d`
    fn propagate(
        &self,
        d: &Tensor,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let s = &self.schedule;
        let h = s.lambda_t(prev_timestep) - s.lambda_t(timestep);
        let sample_coeff = s.sigma_t(prev_timestep) / s.sigma_t(timestep);
        let d_coeff = -s.alpha_t(prev_timestep) * ((-h).exp() - 1.);
        (sample * sample_coeff)? + (d * d_coeff)?
    }

    fn first_order_update(
        &self,
        x0: &Tensor,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        self.propagate(x0, timestep, prev_timestep, sample)
    }

    fn second_order_update(
        &self,
        timestep: usize,
        prev_timestep: usize,
        last_timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let s = &self.schedule;
        let n = self.model_outputs.len();
        let (m0, m1) = (&self.model_outputs[n - 1], &self.model_outputs[n - 2]);

        let h = s.lambda_t(prev_timestep) - s.lambda_t(timestep);
        let h_0 = s.lambda_t(timestep) - s.lambda_t(last_timestep);
        let r0 = h_0 / h;

        // Midpoint extrapolation D0 + D1 / 2 with D1 = (m0 - m1) / r0.
        let w = 1. / (2. * r0);
        let d = ((m0 * (1. + w))? - (m1 * w)?)?;
        self.propagate(&d, timestep, prev_timestep, sample)
    }
}

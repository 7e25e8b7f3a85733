//! Reference adapter: a small selective-scan-style recurrent model.
//!
//! The interesting property of state-space architectures for the
//! interception machinery is the scan: one recurrent cell invoked once
//! per token, so a single module path fires `seq_len` times in every
//! forward pass and interventions must disambiguate occurrences.
//!
//! Architecture per layer: `in_proj -> scan cell (per token) -> out_proj`
//! with a residual connection, between an embedding and an LM head.
//!
//! The scan cell's recurrence is pointless on degenerate data, so the
//! trace patches it with a shape-correct zero kernel — the same move the
//! CUDA scan kernels of real SSM stacks need at trace time.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module};

use crate::error::Result;
use crate::model::{ForwardContext, ModelAdapter, RunMode};
use crate::module::{GraftModule, ModuleTree, WrapperModule};
use crate::patching::{Patch, Patcher};

/// Dimensions of the reference model.
#[derive(Debug, Clone, Copy)]
pub struct SsmConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 16,
            d_model: 4,
            n_layers: 2,
        }
    }
}

struct EmbeddingModule(Embedding);

impl GraftModule for EmbeddingModule {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        let [ids] = xs else {
            return Err(candle_core::Error::msg(format!(
                "embedding expects exactly one input, got {}",
                xs.len()
            ))
            .into());
        };
        Ok(self.0.forward(ids)?)
    }

    fn param(&self, name: &str) -> Option<Tensor> {
        (name == "weight").then(|| self.0.embeddings().clone())
    }
}

struct LinearModule(Linear);

impl GraftModule for LinearModule {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        let [x] = xs else {
            return Err(candle_core::Error::msg(format!(
                "linear expects exactly one input, got {}",
                xs.len()
            ))
            .into());
        };
        Ok(self.0.forward(x)?)
    }

    fn param(&self, name: &str) -> Option<Tensor> {
        match name {
            "weight" => Some(self.0.weight().clone()),
            "bias" => self.0.bias().cloned(),
            _ => None,
        }
    }
}

/// One scan step: `h' = tanh(Wx x_t + Wh h)`.
struct ScanCell {
    wx: Linear,
    wh: Linear,
}

impl GraftModule for ScanCell {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        let [x, h] = xs else {
            return Err(candle_core::Error::msg(format!(
                "scan cell expects (x_t, h), got {} inputs",
                xs.len()
            ))
            .into());
        };
        let mixed = (&self.wx.forward(x)? + &self.wh.forward(h)?)?;
        Ok(mixed.tanh()?)
    }
}

/// Trace-time stand-in for the scan cell: correctly shaped zeros, no
/// recurrence.
struct ScanStandIn;

impl GraftModule for ScanStandIn {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        let [x, _h] = xs else {
            return Err(candle_core::Error::msg(format!(
                "scan stand-in expects (x_t, h), got {} inputs",
                xs.len()
            ))
            .into());
        };
        Ok(x.zeros_like()?)
    }
}

/// Adapter for the reference SSM. Meta weights are zeros; local weights
/// are randomly initialized (a real deployment would load a checkpoint
/// here instead).
pub struct SsmAdapter {
    config: SsmConfig,
    device: Device,
}

impl SsmAdapter {
    pub fn new(config: SsmConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    pub fn config(&self) -> &SsmConfig {
        &self.config
    }

    fn weight(&self, shape: (usize, usize), degenerate: bool) -> Result<Tensor> {
        if degenerate {
            Ok(Tensor::zeros(shape, DType::F32, &self.device)?)
        } else {
            Ok(Tensor::randn(0.0_f32, 0.02, shape, &self.device)?)
        }
    }

    fn linear(&self, d_in: usize, d_out: usize, degenerate: bool) -> Result<Linear> {
        let w = self.weight((d_out, d_in), degenerate)?;
        let b = Tensor::zeros((d_out,), DType::F32, &self.device)?;
        Ok(Linear::new(w, Some(b)))
    }

    fn build(&self, degenerate: bool) -> Result<ModuleTree> {
        let SsmConfig {
            vocab_size,
            d_model,
            n_layers,
        } = self.config;
        let mut tree = ModuleTree::new();

        let emb = self.weight((vocab_size, d_model), degenerate)?;
        tree.insert(
            "embedding",
            Box::new(EmbeddingModule(Embedding::new(emb, d_model))),
        )?;

        tree.insert("layers", Box::new(WrapperModule))?;
        for i in 0..n_layers {
            tree.insert(&format!("layers.{i}"), Box::new(WrapperModule))?;
            tree.insert(
                &format!("layers.{i}.in_proj"),
                Box::new(LinearModule(self.linear(d_model, d_model, degenerate)?)),
            )?;
            tree.insert(
                &format!("layers.{i}.cell"),
                Box::new(ScanCell {
                    wx: self.linear(d_model, d_model, degenerate)?,
                    wh: self.linear(d_model, d_model, degenerate)?,
                }),
            )?;
            tree.insert(
                &format!("layers.{i}.out_proj"),
                Box::new(LinearModule(self.linear(d_model, d_model, degenerate)?)),
            )?;
        }

        tree.insert(
            "lm_head",
            Box::new(LinearModule(self.linear(d_model, vocab_size, degenerate)?)),
        )?;
        Ok(tree)
    }
}

impl ModelAdapter for SsmAdapter {
    fn load_meta(&self) -> Result<ModuleTree> {
        self.build(true)
    }

    fn load_local(&self) -> Result<ModuleTree> {
        self.build(false)
    }

    fn prepare_inputs(&self, raw: &[u32]) -> Result<Tensor> {
        Ok(Tensor::from_vec(raw.to_vec(), (1, raw.len()), &self.device)?)
    }

    fn trace_patches(&self) -> Result<Patcher> {
        let mut patcher = Patcher::new();
        for i in 0..self.config.n_layers {
            patcher.add(Patch::new(
                format!("layers.{i}.cell"),
                Box::new(ScanStandIn),
            ));
        }
        Ok(patcher)
    }

    fn forward(
        &self,
        _tree: &ModuleTree,
        input: &Tensor,
        _mode: RunMode,
        ctx: &mut dyn ForwardContext,
    ) -> Result<Tensor> {
        let mut x = ctx.call("embedding", &[input.clone()])?;
        let (_batch, seq_len, _d) = x.dims3()?;

        for i in 0..self.config.n_layers {
            let h_in = ctx.call(&format!("layers.{i}.in_proj"), &[x.clone()])?;
            let mut h = Tensor::zeros((1, self.config.d_model), DType::F32, &self.device)?;
            let mut ys = Vec::with_capacity(seq_len);
            for t in 0..seq_len {
                let xt = h_in.narrow(1, t, 1)?.squeeze(1)?;
                h = ctx.call(&format!("layers.{i}.cell"), &[xt, h])?;
                ys.push(h.clone());
            }
            let y = Tensor::stack(&ys, 1)?;
            let y = ctx.call(&format!("layers.{i}.out_proj"), &[y])?;
            x = (&x + &y)?;
        }

        ctx.call("lm_head", &[x])
    }

    fn generate(
        &self,
        tree: &ModuleTree,
        input: &Tensor,
        max_new_tokens: usize,
        mode: RunMode,
        ctx: &mut dyn ForwardContext,
    ) -> Result<Tensor> {
        let mut tokens = input.clone();
        for _ in 0..max_new_tokens {
            let logits = self.forward(tree, &tokens, mode, ctx)?;
            let (_batch, seq_len, _vocab) = logits.dims3()?;
            let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
            let next = last.argmax(D::Minus1)?.unsqueeze(0)?;
            tokens = Tensor::cat(&[&tokens, &next], 1)?;
            ctx.advance_step()?;
        }
        Ok(tokens)
    }
}

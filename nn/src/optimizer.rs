use crate::model::layers::Param;
use crate::model::Network;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Updates network parameters from their accumulated gradients
pub trait Optimizer {
    /// Applies one update to every parameter
    fn step(&mut self, network: &mut Network);

    fn set_lr(&mut self, lr: f32);

    fn lr(&self) -> f32;
}

/// Adam, with bias correction folded into the step size
#[derive(Clone, Debug, PartialEq)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,

    /// Number of steps taken
    t: u64,
    /// First and second moments, one pair per network parameter
    moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl Adam {
    pub fn new(network: &Network, lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            moments: network
                .params()
                .iter()
                .map(|p| (vec![0.0; p.len()], vec![0.0; p.len()]))
                .collect(),
        }
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Serializes the full state, so a restored optimizer continues bit for bit
    pub fn write_state(&self, write: &mut dyn Write) -> io::Result<()> {
        write.write_f32::<LittleEndian>(self.lr)?;
        write.write_f32::<LittleEndian>(self.beta1)?;
        write.write_f32::<LittleEndian>(self.beta2)?;
        write.write_f32::<LittleEndian>(self.epsilon)?;
        write.write_u64::<LittleEndian>(self.t)?;

        write.write_u64::<LittleEndian>(self.moments.len() as u64)?;
        for (m, v) in &self.moments {
            write.write_u64::<LittleEndian>(m.len() as u64)?;
            for (&a, &b) in m.iter().zip(v) {
                write.write_f32::<LittleEndian>(a)?;
                write.write_f32::<LittleEndian>(b)?;
            }
        }
        Ok(())
    }

    /// Restores a state written by `write_state`, checking it matches the network's parameters
    pub fn read_state(network: &Network, read: &mut dyn Read) -> io::Result<Self> {
        let mut adam = Adam::new(network, 0.0);
        adam.lr = read.read_f32::<LittleEndian>()?;
        adam.beta1 = read.read_f32::<LittleEndian>()?;
        adam.beta2 = read.read_f32::<LittleEndian>()?;
        adam.epsilon = read.read_f32::<LittleEndian>()?;
        adam.t = read.read_u64::<LittleEndian>()?;

        let count = read.read_u64::<LittleEndian>()? as usize;
        if count != adam.moments.len() {
            return Err(invalid_data(format!(
                "optimizer has {} tensors, network has {}",
                count,
                adam.moments.len()
            )));
        }

        for (m, v) in adam.moments.iter_mut() {
            let len = read.read_u64::<LittleEndian>()? as usize;
            if len != m.len() {
                return Err(invalid_data(format!(
                    "optimizer tensor of length {}, expected {}",
                    len,
                    m.len()
                )));
            }
            for i in 0..len {
                m[i] = read.read_f32::<LittleEndian>()?;
                v[i] = read.read_f32::<LittleEndian>()?;
            }
        }

        Ok(adam)
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn adam_update(
    param: &mut Param,
    m: &mut [f32],
    v: &mut [f32],
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    lr_t: f32,
) {
    for i in 0..param.value.len() {
        let g = param.grad[i];

        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;

        param.value[i] -= lr_t * m[i] / (v[i].sqrt() + epsilon);
    }
}

impl Optimizer for Adam {
    fn step(&mut self, network: &mut Network) {
        self.t += 1;

        let t = self.t.min(i32::MAX as u64) as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));

        for (param, (m, v)) in network.params_mut().into_iter().zip(self.moments.iter_mut()) {
            adam_update(param, m, v, self.beta1, self.beta2, self.epsilon, lr_t);
        }
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

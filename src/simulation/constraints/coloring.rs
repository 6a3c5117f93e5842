use std::collections::HashSet;

/**
 * Greedy graph coloring: elements inside one color never share a particle, so
 * a color can be projected in parallel. Element order inside a color follows
 * the input order, which keeps the result deterministic.
 */
pub fn color_elements<const N: usize>(elements: &[[usize; N]]) -> Vec<Vec<usize>> {
    let mut color_particles: Vec<HashSet<usize>> = Vec::new();
    let mut colors: Vec<Vec<usize>> = Vec::new();

    for (e, element) in elements.iter().enumerate() {
        let color = color_particles
            .iter()
            .position(|used| element.iter().all(|i| !used.contains(i)));
        let color = match color {
            Some(c) => c,
            None => {
                color_particles.push(HashSet::new());
                colors.push(Vec::new());
                colors.len() - 1
            }
        };
        color_particles[color].extend(element.iter().cloned());
        colors[color].push(e);
    }

    colors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_never_share_particles() {
        let elements = [[0, 1], [1, 2], [2, 3], [3, 0], [0, 2]];
        let colors = color_elements(&elements);

        let total: usize = colors.iter().map(|c| c.len()).sum();
        assert_eq!(total, elements.len());

        for color in &colors {
            let mut seen = HashSet::new();
            for &e in color {
                for &i in &elements[e] {
                    assert!(seen.insert(i), "particle {} used twice in one color", i);
                }
            }
        }
    }

    #[test]
    fn chain_needs_two_colors() {
        let elements = [[0, 1], [1, 2], [2, 3], [3, 4]];
        assert_eq!(color_elements(&elements), vec![vec![0, 2], vec![1, 3]]);
    }
}
